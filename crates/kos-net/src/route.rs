//! IPv4 routing table
//!
//! An unordered list scanned on every lookup. The winning entry is the UP
//! route with the longest matching genmask, ties broken by lowest metric.
//! The default route is destination 0.0.0.0 with mask 0.0.0.0.

use std::net::Ipv4Addr;

use kos_core::error::{KernelError, KernelResult};

use crate::NetStack;

/// Route flag bits
pub const RTF_UP: u32 = 0x0001;
pub const RTF_GATEWAY: u32 = 0x0002;
pub const RTF_HOST: u32 = 0x0004;
pub const RTF_DYNAMIC: u32 = 0x0010;
pub const RTF_STATIC: u32 = 0x0020;

/// Maximum table size
pub const ROUTE_TABLE_MAX: usize = 1024;

/// One routing entry
#[derive(Debug, Clone)]
pub struct Route {
    pub dest: Ipv4Addr,
    pub genmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub ifindex: u32,
    pub flags: u32,
    pub metric: u32,
    pub use_count: u64,
}

impl Route {
    #[inline]
    fn matches(&self, dst: Ipv4Addr) -> bool {
        let mask = u32::from(self.genmask);
        (u32::from(dst) & mask) == (u32::from(self.dest) & mask)
    }

    #[inline]
    fn mask_len(&self) -> u32 {
        u32::from(self.genmask).count_ones()
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.flags & RTF_UP != 0
    }
}

/// The table proper, used under the stack's route lock
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Insert a route, updating in place when the exact (dest, genmask)
    /// pair already exists
    pub fn add(&mut self, mut route: Route) -> KernelResult<()> {
        route.flags |= RTF_UP;
        if route.gateway.is_some() {
            route.flags |= RTF_GATEWAY;
        }
        if route.genmask == Ipv4Addr::BROADCAST {
            route.flags |= RTF_HOST;
        }

        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.dest == route.dest && r.genmask == route.genmask)
        {
            route.use_count = existing.use_count;
            *existing = route;
            return Ok(());
        }

        if self.routes.len() >= ROUTE_TABLE_MAX {
            return Err(KernelError::ResourceExhausted);
        }
        self.routes.push(route);
        Ok(())
    }

    /// Remove the route with the exact (dest, genmask) pair
    pub fn del(&mut self, dest: Ipv4Addr, genmask: Ipv4Addr) -> KernelResult<()> {
        let pos = self
            .routes
            .iter()
            .position(|r| r.dest == dest && r.genmask == genmask)
            .ok_or(KernelError::NotFound)?;
        self.routes.remove(pos);
        Ok(())
    }

    /// Longest-prefix match over UP routes, ties by lowest metric
    ///
    /// Bumps the winner's use count.
    pub fn lookup(&mut self, dst: Ipv4Addr) -> Option<Route> {
        let mut best: Option<usize> = None;
        for (i, route) in self.routes.iter().enumerate() {
            if !route.is_up() || !route.matches(dst) {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let cur = &self.routes[b];
                    if route.mask_len() > cur.mask_len()
                        || (route.mask_len() == cur.mask_len() && route.metric < cur.metric)
                    {
                        best = Some(i);
                    }
                }
            }
        }
        best.map(|i| {
            self.routes[i].use_count += 1;
            self.routes[i].clone()
        })
    }

    /// Drop DYNAMIC routes that were never used
    pub fn gc_dynamic(&mut self) -> usize {
        let before = self.routes.len();
        self.routes
            .retain(|r| r.flags & RTF_DYNAMIC == 0 || r.use_count > 0);
        before - self.routes.len()
    }

    /// Remove every route referencing a deleted interface
    pub fn purge_iface(&mut self, ifindex: u32) {
        self.routes.retain(|r| r.ifindex != ifindex);
    }
}

impl NetStack {
    /// Add a route; static unless `RTF_DYNAMIC` is passed in `flags`
    pub fn route_add(
        &self,
        dest: Ipv4Addr,
        genmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        ifindex: u32,
        metric: u32,
        flags: u32,
    ) -> KernelResult<()> {
        if self.iface_by_index(ifindex).is_none() {
            return Err(KernelError::NotFound);
        }
        let flags = if flags & RTF_DYNAMIC != 0 { flags } else { flags | RTF_STATIC };
        self.routes.lock().unwrap().add(Route {
            dest,
            genmask,
            gateway,
            ifindex,
            flags,
            metric,
            use_count: 0,
        })
    }

    /// Convenience: default route via `gateway`
    pub fn route_add_default(&self, gateway: Ipv4Addr, ifindex: u32) -> KernelResult<()> {
        self.route_add(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Some(gateway),
            ifindex,
            0,
            0,
        )
    }

    pub fn route_del(&self, dest: Ipv4Addr, genmask: Ipv4Addr) -> KernelResult<()> {
        self.routes.lock().unwrap().del(dest, genmask)
    }

    /// Longest-prefix route lookup
    pub fn route_lookup(&self, dst: Ipv4Addr) -> KernelResult<Route> {
        self.routes
            .lock()
            .unwrap()
            .lookup(dst)
            .ok_or(KernelError::HostUnreachable)
    }

    /// Periodic GC of unused dynamic routes
    pub(crate) fn route_sweep(&self) {
        let removed = self.routes.lock().unwrap().gc_dynamic();
        if removed > 0 {
            log::trace!("route: reclaimed {} dynamic entries", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(routes: &[(&str, &str, u32)]) -> RouteTable {
        let mut t = RouteTable::default();
        for (dest, mask, metric) in routes {
            t.add(Route {
                dest: dest.parse().unwrap(),
                genmask: mask.parse().unwrap(),
                gateway: None,
                ifindex: 0,
                flags: 0,
                metric: *metric,
                use_count: 0,
            })
            .unwrap();
        }
        t
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut t = table_with(&[
            ("0.0.0.0", "0.0.0.0", 0),
            ("10.0.0.0", "255.0.0.0", 0),
            ("10.1.0.0", "255.255.0.0", 0),
        ]);
        let hit = t.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit.genmask, "255.255.0.0".parse::<Ipv4Addr>().unwrap());

        // Anything else falls through to the default route.
        let hit = t.lookup("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(hit.genmask, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_metric_breaks_ties() {
        // Two distinct (dest, genmask) pairs covering the same network;
        // equal mask length forces the metric comparison.
        let mut t = table_with(&[
            ("10.0.0.1", "255.0.0.0", 10),
            ("10.0.0.2", "255.0.0.0", 2),
        ]);
        assert_eq!(t.len(), 2);
        let hit = t.lookup("10.5.5.5".parse().unwrap()).unwrap();
        assert_eq!(hit.metric, 2);
    }

    #[test]
    fn test_add_updates_in_place() {
        let mut t = table_with(&[("192.168.0.0", "255.255.0.0", 5)]);
        t.add(Route {
            dest: "192.168.0.0".parse().unwrap(),
            genmask: "255.255.0.0".parse().unwrap(),
            gateway: Some("192.168.0.254".parse().unwrap()),
            ifindex: 2,
            flags: 0,
            metric: 1,
            use_count: 0,
        })
        .unwrap();

        assert_eq!(t.len(), 1);
        let hit = t.lookup("192.168.3.4".parse().unwrap()).unwrap();
        assert_eq!(hit.metric, 1);
        assert_eq!(hit.ifindex, 2);
        assert!(hit.flags & RTF_GATEWAY != 0);
    }

    #[test]
    fn test_gc_reclaims_unused_dynamic() {
        let mut t = RouteTable::default();
        t.add(Route {
            dest: "172.16.0.0".parse().unwrap(),
            genmask: "255.255.0.0".parse().unwrap(),
            gateway: None,
            ifindex: 0,
            flags: RTF_DYNAMIC,
            metric: 0,
            use_count: 0,
        })
        .unwrap();
        t.add(Route {
            dest: "172.17.0.0".parse().unwrap(),
            genmask: "255.255.0.0".parse().unwrap(),
            gateway: None,
            ifindex: 0,
            flags: RTF_DYNAMIC,
            metric: 0,
            use_count: 0,
        })
        .unwrap();

        // Use only the second route.
        t.lookup("172.17.0.1".parse().unwrap()).unwrap();
        assert_eq!(t.gc_dynamic(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_no_route() {
        let mut t = table_with(&[("10.0.0.0", "255.0.0.0", 0)]);
        assert!(t.lookup("192.168.1.1".parse().unwrap()).is_none());
    }
}
