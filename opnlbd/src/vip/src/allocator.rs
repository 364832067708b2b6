use std::collections::HashMap;
use std::net::IpAddr;

use super::error::Error;

/// Assigns a virtual IP to a service key.
///
/// `Single` hands every key the one configured address. That address is
/// externally managed and shared, so `get` reports no binding and cleanup
/// must not tear the alias down.
/// `Pool` binds each key to the first unused entry of a fixed, ordered
/// address list. Bindings are stable until released.
#[derive(Debug)]
pub enum VipAllocator {
    Single(SingleVip),
    Pool(PoolAllocator),
}

impl VipAllocator {
    pub fn single(vip: IpAddr) -> VipAllocator {
        VipAllocator::Single(SingleVip { vip })
    }

    pub fn pool(vips: Vec<IpAddr>) -> Result<VipAllocator, Error> {
        if vips.is_empty() {
            return Err(Error::EmptyPool);
        }
        Ok(VipAllocator::Pool(PoolAllocator::new(vips)))
    }

    /// Returns the VIP bound to the key, binding a fresh one when needed.
    /// `None` means the pool is exhausted.
    pub fn allocate(&mut self, key: &str) -> Option<IpAddr> {
        match self {
            VipAllocator::Single(s) => Some(s.vip),
            VipAllocator::Pool(p) => p.allocate(key),
        }
    }

    pub fn release(&mut self, key: &str) {
        match self {
            VipAllocator::Single(_) => {}
            VipAllocator::Pool(p) => p.release(key),
        }
    }

    /// Current binding for the key. Empty in single-VIP mode so that the
    /// cleanup path never removes the shared alias.
    pub fn get(&self, key: &str) -> Option<IpAddr> {
        match self {
            VipAllocator::Single(_) => None,
            VipAllocator::Pool(p) => p.get(key),
        }
    }

    /// Re-adopt a binding observed on the object itself. In-memory state
    /// does not survive a controller restart; the address already written
    /// to the object status is the more reliable record. Fails when the
    /// address is outside the pool or held by another key.
    pub fn claim(&mut self, key: &str, addr: IpAddr) -> bool {
        match self {
            VipAllocator::Single(_) => false,
            VipAllocator::Pool(p) => p.claim(key, addr),
        }
    }
}

#[derive(Debug)]
pub struct SingleVip {
    vip: IpAddr,
}

#[derive(Debug)]
pub struct PoolAllocator {
    pool: Vec<IpAddr>,
    used: HashMap<IpAddr, String>,
    assign: HashMap<String, IpAddr>,
}

impl PoolAllocator {
    fn new(pool: Vec<IpAddr>) -> PoolAllocator {
        PoolAllocator {
            pool,
            used: HashMap::new(),
            assign: HashMap::new(),
        }
    }

    fn allocate(&mut self, key: &str) -> Option<IpAddr> {
        if let Some(vip) = self.assign.get(key) {
            return Some(*vip);
        }
        for vip in self.pool.iter() {
            if !self.used.contains_key(vip) {
                self.used.insert(*vip, key.to_string());
                self.assign.insert(key.to_string(), *vip);
                return Some(*vip);
            }
        }
        None
    }

    fn release(&mut self, key: &str) {
        if let Some(vip) = self.assign.remove(key) {
            self.used.remove(&vip);
        }
    }

    fn get(&self, key: &str) -> Option<IpAddr> {
        self.assign.get(key).copied()
    }

    fn claim(&mut self, key: &str, addr: IpAddr) -> bool {
        if self.assign.get(key) == Some(&addr) {
            return true;
        }
        if !self.pool.contains(&addr) || self.used.contains_key(&addr) {
            return false;
        }
        // The key may hold a different address from an earlier attempt.
        self.release(key);
        self.used.insert(addr, key.to_string());
        self.assign.insert(key.to_string(), addr);
        true
    }
}
