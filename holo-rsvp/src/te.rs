//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Inconsistency};

// Bandwidth in kbit/s.
pub type Bandwidth = u64;
// Setup/holding priority (0 is the most urgent).
pub type Priority = u8;
pub type IfIndex = u32;

pub const PRIORITY_LEVELS: usize = 8;
pub const PRIORITY_LOWEST: Priority = 7;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct TeLinkId(pub u32);

// Traffic-engineering link as known to the topology database.
//
// Local links are backed by one or more component links, whose reservable
// bandwidth is tracked by the ledger. Remote links only carry what their
// owners advertise.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TeLink {
    pub id: TeLinkId,
    pub local_addr: Ipv4Addr,
    pub remote_node: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    pub admin_groups: u32,
    pub advertised: [Bandwidth; PRIORITY_LEVELS],
    #[serde(skip)]
    pub components: BTreeSet<IfIndex>,
}

// Physical or bundled interface inside a TE link.
//
// Besides the reservable vector, the link keeps an 8x8 allocation matrix.
// Diagonal cell `[p][p]` is bandwidth held at priority `p` that is backed by
// free capacity. Off-diagonal cell `[p][j]` (with `j > p`) is bandwidth held
// at priority `p` that overlaps with holders at band `j`, and that can only
// be reclaimed by preempting them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComponentLink {
    pub ifindex: IfIndex,
    pub te_link: TeLinkId,
    configured: [Bandwidth; PRIORITY_LEVELS],
    reservable: [Bandwidth; PRIORITY_LEVELS],
    allocated: [[Bandwidth; PRIORITY_LEVELS]; PRIORITY_LEVELS],
}

#[derive(Debug, Default)]
pub struct TeDatabase {
    te_links: BTreeMap<TeLinkId, TeLink>,
    te_links_by_addr: BTreeMap<Ipv4Addr, TeLinkId>,
    components: BTreeMap<IfIndex, ComponentLink>,
}

// ===== impl TeLinkId =====

impl std::fmt::Display for TeLinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "te-link-{}", self.0)
    }
}

// ===== impl TeLink =====

impl TeLink {
    pub fn new(
        id: TeLinkId,
        local_addr: Ipv4Addr,
        remote_node: Ipv4Addr,
        remote_addr: Ipv4Addr,
    ) -> TeLink {
        TeLink {
            id,
            local_addr,
            remote_node,
            remote_addr,
            admin_groups: 0,
            advertised: [0; PRIORITY_LEVELS],
            components: Default::default(),
        }
    }

    pub fn is_local(&self) -> bool {
        !self.components.is_empty()
    }
}

// ===== impl ComponentLink =====

impl ComponentLink {
    pub fn new(
        ifindex: IfIndex,
        te_link: TeLinkId,
        configured: [Bandwidth; PRIORITY_LEVELS],
    ) -> Result<ComponentLink, Error> {
        if !is_non_increasing(&configured) {
            return Err(Error::InvalidReservableBw(ifindex));
        }

        Ok(ComponentLink {
            ifindex,
            te_link,
            configured,
            reservable: configured,
            allocated: Default::default(),
        })
    }

    pub fn configured(&self, priority: Priority) -> Bandwidth {
        self.configured[priority as usize]
    }

    pub fn reservable(&self, priority: Priority) -> Bandwidth {
        self.reservable[priority as usize]
    }

    pub fn reservable_vector(&self) -> [Bandwidth; PRIORITY_LEVELS] {
        self.reservable
    }

    pub fn allocated(&self, row: Priority, col: Priority) -> Bandwidth {
        self.allocated[row as usize][col as usize]
    }

    // Total bandwidth held at the given priority.
    pub fn committed(&self, priority: Priority) -> Bandwidth {
        self.allocated[priority as usize].iter().sum()
    }

    // Bandwidth that can be taken at the given priority without overlapping
    // any existing holder.
    pub fn unreserved_from(&self, priority: Priority) -> Bandwidth {
        self.reservable[priority as usize..]
            .iter()
            .copied()
            .min()
            .unwrap_or(0)
    }

    // Bandwidth an LSP could obtain by holding at `hold` and preempting up
    // to its setup priority.
    pub fn admissible(&self, hold: Priority, setup: Priority) -> Bandwidth {
        let (lo, hi) = (setup.min(hold) as usize, setup.max(hold) as usize);
        self.reservable[lo..=hi].iter().copied().min().unwrap_or(0)
    }

    // Tightest band that the given row overlaps with, along with the amount.
    pub fn overlap(&self, row: Priority) -> Option<(Priority, Bandwidth)> {
        self.overlap_beyond(row, row)
    }

    // Same as `overlap`, ignoring bands up to `band`.
    pub fn overlap_beyond(
        &self,
        row: Priority,
        band: Priority,
    ) -> Option<(Priority, Bandwidth)> {
        let row = row as usize;
        (row.max(band as usize) + 1..PRIORITY_LEVELS)
            .find(|col| self.allocated[row][*col] > 0)
            .map(|col| (col as Priority, self.allocated[row][col]))
    }

    // Bandwidth of the given row not backed by free capacity.
    pub fn overlap_total(&self, row: Priority) -> Bandwidth {
        let row = row as usize;
        self.allocated[row][row + 1..].iter().sum()
    }

    // Takes `bw` at priority `priority`, debiting every band from `priority`
    // down to the loosest one. Returns the part overlapping with looser
    // holders.
    pub(crate) fn allocate(
        &mut self,
        bw: Bandwidth,
        priority: Priority,
    ) -> Result<Bandwidth, Error> {
        if self.reservable(priority) < bw {
            return Err(Error::NoBandwidth(self.ifindex, priority, bw));
        }

        let overlap = self.place(priority as usize, bw);
        self.check_invariants();
        Ok(overlap)
    }

    // Gives back `bw` held at priority `priority`.
    pub(crate) fn release(
        &mut self,
        bw: Bandwidth,
        priority: Priority,
    ) -> Result<(), Error> {
        let committed = self.committed(priority);
        if committed < bw {
            return Err(Error::LedgerInconsistency(
                Inconsistency::ReleaseExceedsCommitted {
                    ifindex: self.ifindex,
                    priority,
                    bw,
                    committed,
                },
            ));
        }

        let row = priority as usize;
        let mut remaining = bw;

        // Overlapping cells go first, loosest band first.
        for col in (row + 1..PRIORITY_LEVELS).rev() {
            let y = remaining.min(self.allocated[row][col]);
            if y == 0 {
                continue;
            }
            self.lift(row, col, y);
            remaining -= y;
        }

        // Then the part backed by free capacity.
        self.allocated[row][row] -= remaining;
        for band in row..PRIORITY_LEVELS {
            self.reservable[band] += remaining;
        }

        self.normalize(row);
        self.check_invariants();
        Ok(())
    }

    // Replaces the configured reservable vector.
    pub(crate) fn set_configured(
        &mut self,
        configured: [Bandwidth; PRIORITY_LEVELS],
    ) -> Result<(), Error> {
        if !is_non_increasing(&configured) {
            return Err(Error::InvalidReservableBw(self.ifindex));
        }
        let mut reservable = [0; PRIORITY_LEVELS];
        for (band, reservable) in reservable.iter_mut().enumerate() {
            let charge = self.charge(band);
            if configured[band] < charge {
                return Err(Error::InvalidReservableBw(self.ifindex));
            }
            *reservable = configured[band] - charge;
        }
        if !is_non_increasing(&reservable) {
            return Err(Error::InvalidReservableBw(self.ifindex));
        }

        self.configured = configured;
        self.reservable = reservable;
        self.normalize(0);
        self.check_invariants();
        Ok(())
    }

    // Checks that the reservable vector accounts for every held unit of
    // bandwidth and that overlap only exists where bands are exhausted.
    pub fn conserved(&self) -> bool {
        (0..PRIORITY_LEVELS).all(|band| {
            let consistent = self.reservable[band] <= self.configured[band]
                && self.configured[band] - self.reservable[band]
                    == self.charge(band);
            let monotonic = band == 0
                || self.reservable[band] <= self.reservable[band - 1];
            let overlap = (0..band).any(|row| self.allocated[row][band] > 0);
            consistent && monotonic && (!overlap || self.reservable[band] == 0)
        })
    }

    fn charge(&self, band: usize) -> Bandwidth {
        (0..=band)
            .map(|row| {
                self.allocated[row][row]
                    + self.allocated[row][band + 1..].iter().sum::<Bandwidth>()
            })
            .sum()
    }

    fn place(&mut self, row: usize, bw: Bandwidth) -> Bandwidth {
        let mut shortfall_prev = 0;
        for band in row..PRIORITY_LEVELS {
            let shortfall = bw.saturating_sub(self.reservable[band]);
            self.reservable[band] = self.reservable[band].saturating_sub(bw);
            if band > row {
                self.allocated[row][band] += shortfall - shortfall_prev;
            }
            shortfall_prev = shortfall;
        }
        self.allocated[row][row] += bw - shortfall_prev;
        shortfall_prev
    }

    // Removes `y` from an overlapping cell.
    fn lift(&mut self, row: usize, col: usize, y: Bandwidth) {
        self.allocated[row][col] -= y;
        for band in row..col {
            self.reservable[band] += y;
        }
    }

    // Moves overlapping cells back onto free capacity wherever a band has
    // regained some, tightest band and tightest row first.
    fn normalize(&mut self, from: usize) {
        for col in from..PRIORITY_LEVELS {
            for row in 0..col {
                let y = self.allocated[row][col].min(self.reservable[col]);
                if y == 0 {
                    continue;
                }
                self.lift(row, col, y);
                self.place(row, y);
            }
        }
    }

    fn check_invariants(&self) {
        debug_assert!(self.conserved(), "component link {self:?}");
    }
}

// ===== impl TeDatabase =====

impl TeDatabase {
    pub fn te_link(&self, id: TeLinkId) -> Option<&TeLink> {
        self.te_links.get(&id)
    }

    pub fn te_link_by_addr(&self, addr: Ipv4Addr) -> Option<&TeLink> {
        self.te_links_by_addr
            .get(&addr)
            .and_then(|id| self.te_links.get(id))
    }

    pub fn te_links(&self) -> impl Iterator<Item = &TeLink> {
        self.te_links.values()
    }

    pub fn component_link(&self, ifindex: IfIndex) -> Option<&ComponentLink> {
        self.components.get(&ifindex)
    }

    pub(crate) fn component_link_mut(
        &mut self,
        ifindex: IfIndex,
    ) -> Result<&mut ComponentLink, Error> {
        self.components
            .get_mut(&ifindex)
            .ok_or(Error::ComponentLinkNotFound(ifindex))
    }

    pub(crate) fn add_te_link(&mut self, mut te_link: TeLink) {
        if let Some(old) = self.te_links.get(&te_link.id) {
            self.te_links_by_addr.remove(&old.remote_addr);
            te_link.components = old.components.clone();
        }
        self.te_links_by_addr.insert(te_link.remote_addr, te_link.id);
        self.te_links.insert(te_link.id, te_link);
    }

    pub(crate) fn add_component_link(
        &mut self,
        link: ComponentLink,
    ) -> Result<(), Error> {
        if self.components.contains_key(&link.ifindex) {
            return Err(Error::ComponentLinkExists(link.ifindex));
        }
        let te_link = self
            .te_links
            .get_mut(&link.te_link)
            .ok_or(Error::TeLinkNotFound(link.te_link))?;
        te_link.components.insert(link.ifindex);
        self.components.insert(link.ifindex, link);
        Ok(())
    }

    pub(crate) fn remove_component_link(
        &mut self,
        ifindex: IfIndex,
    ) -> Option<ComponentLink> {
        let link = self.components.remove(&ifindex)?;
        if let Some(te_link) = self.te_links.get_mut(&link.te_link) {
            te_link.components.remove(&ifindex);
        }
        Some(link)
    }

    // Per-priority maximum reservable bandwidth of a TE link.
    //
    // For local links this is the maximum over the component links. Remote
    // links report what was advertised.
    pub fn max_reservable(
        &self,
        te_link: TeLinkId,
    ) -> Option<[Bandwidth; PRIORITY_LEVELS]> {
        let te_link = self.te_links.get(&te_link)?;
        if !te_link.is_local() {
            return Some(te_link.advertised);
        }

        let mut max = [0; PRIORITY_LEVELS];
        for link in te_link
            .components
            .iter()
            .filter_map(|ifindex| self.components.get(ifindex))
        {
            for (band, max) in max.iter_mut().enumerate() {
                *max = (*max).max(link.reservable[band]);
            }
        }
        Some(max)
    }
}

// ===== global functions =====

pub fn is_valid_priority(priority: Priority) -> bool {
    priority <= PRIORITY_LOWEST
}

// ===== helper functions =====

fn is_non_increasing(vector: &[Bandwidth; PRIORITY_LEVELS]) -> bool {
    vector.windows(2).all(|pair| pair[0] >= pair[1])
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn link(bw: Bandwidth) -> ComponentLink {
        ComponentLink::new(1, TeLinkId(1), [bw; PRIORITY_LEVELS]).unwrap()
    }

    #[test]
    fn allocate_debits_looser_bands() {
        let mut link = link(100);
        link.allocate(30, 3).unwrap();

        assert_eq!(
            link.reservable_vector(),
            [100, 100, 100, 70, 70, 70, 70, 70]
        );
        assert_eq!(link.allocated(3, 3), 30);
        assert!(link.conserved());
    }

    #[test]
    fn allocate_records_overlap() {
        let mut link = link(100);
        assert_eq!(link.allocate(80, 5).unwrap(), 0);
        assert_eq!(link.allocate(50, 2).unwrap(), 30);

        // Bands 5 to 7 are exhausted, 30 of the new holder overlaps.
        assert_eq!(
            link.reservable_vector(),
            [100, 100, 50, 50, 50, 0, 0, 0]
        );
        assert_eq!(link.allocated(2, 2), 20);
        assert_eq!(link.allocated(2, 5), 30);
        assert_eq!(link.overlap(2), Some((5, 30)));
        assert_eq!(link.overlap_beyond(2, 4), Some((5, 30)));
        assert_eq!(link.overlap_beyond(2, 5), None);
        assert_eq!(link.overlap_total(2), 30);
        assert_eq!(link.unreserved_from(2), 0);
        assert!(link.conserved());
    }

    #[test]
    fn allocate_without_bandwidth() {
        let mut link = link(100);
        link.allocate(60, 4).unwrap();
        let before = link.clone();

        assert!(matches!(
            link.allocate(50, 4),
            Err(Error::NoBandwidth(1, 4, 50))
        ));
        assert_eq!(link, before);
    }

    #[test]
    fn release_lifts_overlap() {
        let mut link = link(100);
        link.allocate(80, 5).unwrap();
        link.allocate(50, 2).unwrap();

        // Releasing the loose holder moves the overlap back onto free
        // capacity.
        link.release(80, 5).unwrap();
        assert_eq!(link.overlap(2), None);
        assert_eq!(link.allocated(2, 2), 50);
        assert_eq!(
            link.reservable_vector(),
            [100, 100, 50, 50, 50, 50, 50, 50]
        );
        assert!(link.conserved());
    }

    #[test]
    fn release_more_than_committed() {
        let mut link = link(100);
        link.allocate(10, 0).unwrap();

        assert!(matches!(
            link.release(20, 0),
            Err(Error::LedgerInconsistency(
                Inconsistency::ReleaseExceedsCommitted { .. }
            ))
        ));
    }

    #[test]
    fn tighter_bands_never_see_less() {
        let mut link = link(200);
        let ops = [(40, 6), (30, 1), (70, 4), (50, 7), (10, 0)];
        for (bw, priority) in ops {
            link.allocate(bw, priority).unwrap();
            for band in 1..PRIORITY_LEVELS {
                assert!(link.reservable[band] <= link.reservable[band - 1]);
            }
        }
        for (bw, priority) in ops {
            link.release(bw, priority).unwrap();
            assert!(link.conserved());
        }
        assert_eq!(link.reservable_vector(), [200; PRIORITY_LEVELS]);
    }

    #[test]
    fn non_increasing_configuration() {
        let increasing = [0, 0, 0, 100, 100, 100, 100, 100];
        assert!(ComponentLink::new(1, TeLinkId(1), increasing).is_err());

        let decreasing = [150, 150, 100, 100, 100, 100, 100, 50];
        assert!(ComponentLink::new(1, TeLinkId(1), decreasing).is_ok());
    }

    #[test]
    fn shrink_below_charge() {
        let mut link = link(100);
        link.allocate(70, 3).unwrap();

        assert!(link.set_configured([60; PRIORITY_LEVELS]).is_err());
        link.set_configured([80; PRIORITY_LEVELS]).unwrap();
        assert_eq!(
            link.reservable_vector(),
            [80, 80, 80, 10, 10, 10, 10, 10]
        );
    }
}
