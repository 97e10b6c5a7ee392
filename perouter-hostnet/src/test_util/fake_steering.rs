//! Steering loader that keeps its maps in memory.

use crate::bpf::{KeySet, Steering, SteeringLoader, converge, neighbor_keys};
use crate::error::Result;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Observable state of every manager a [`FakeSteeringLoader`] built.
#[derive(Debug, Default)]
pub struct FakeSteeringState {
    /// `(nic_index, ul_host_index)` of each load, in order.
    pub loads: Vec<(u32, u32)>,
    /// Loads that have since been closed.
    pub closed: Vec<(u32, u32)>,
    pub neighbors: BTreeSet<[u8; 4]>,
    pub vnis: BTreeSet<u32>,
    /// Every key ever deleted from the VNI map.
    pub removed_vnis: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct FakeSteeringLoader {
    state: Arc<Mutex<FakeSteeringState>>,
}

impl FakeSteeringLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeSteeringState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load_count(&self) -> usize {
        self.state().loads.len()
    }
}

impl SteeringLoader for FakeSteeringLoader {
    fn load(&self, nic_index: u32, ul_host_index: u32) -> Result<Box<dyn Steering>> {
        let mut state = self.state();
        state.loads.push((nic_index, ul_host_index));
        // A fresh load starts with empty maps.
        state.neighbors.clear();
        state.vnis.clear();
        Ok(Box::new(FakeSteering {
            state: Arc::clone(&self.state),
            indexes: (nic_index, ul_host_index),
        }))
    }
}

struct FakeSteering {
    state: Arc<Mutex<FakeSteeringState>>,
    indexes: (u32, u32),
}

impl FakeSteering {
    fn lock(&self) -> MutexGuard<'_, FakeSteeringState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct NeighborSet<'a>(&'a mut FakeSteeringState);

impl KeySet<[u8; 4]> for NeighborSet<'_> {
    fn current(&self) -> Result<Vec<[u8; 4]>> {
        Ok(self.0.neighbors.iter().copied().collect())
    }

    fn add(&mut self, key: [u8; 4]) -> Result<()> {
        self.0.neighbors.insert(key);
        Ok(())
    }

    fn delete(&mut self, key: &[u8; 4]) -> Result<()> {
        self.0.neighbors.remove(key);
        Ok(())
    }
}

struct VniSet<'a>(&'a mut FakeSteeringState);

impl KeySet<u32> for VniSet<'_> {
    fn current(&self) -> Result<Vec<u32>> {
        Ok(self.0.vnis.iter().copied().collect())
    }

    fn add(&mut self, key: u32) -> Result<()> {
        self.0.vnis.insert(key);
        Ok(())
    }

    fn delete(&mut self, key: &u32) -> Result<()> {
        self.0.vnis.remove(key);
        self.0.removed_vnis.push(*key);
        Ok(())
    }
}

impl Steering for FakeSteering {
    fn update_neighbors(&mut self, ips: &[IpAddr]) -> Result<()> {
        let mut state = self.lock();
        converge(&mut NeighborSet(&mut *state), &neighbor_keys(ips))
    }

    fn update_vnis(&mut self, vnis: &[u32]) -> Result<()> {
        let desired: HashSet<u32> = vnis.iter().copied().collect();
        let mut state = self.lock();
        converge(&mut VniSet(&mut *state), &desired)
    }

    fn close(&mut self) -> Result<()> {
        let indexes = self.indexes;
        self.lock().closed.push(indexes);
        Ok(())
    }
}
