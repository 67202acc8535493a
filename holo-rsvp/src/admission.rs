//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use crate::error::Error;
use crate::ledger::{Ledger, OwnerKey};
use crate::te::{
    Bandwidth, ComponentLink, IfIndex, PRIORITY_LOWEST, Priority, TeDatabase,
};

// ===== impl Ledger =====

impl Ledger {
    // How much more bandwidth would be free at `priority` if the owner's
    // tighter reservations on the interface were given back.
    pub fn efficient_bw_at_higher_priorities(
        &self,
        te_db: &TeDatabase,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Result<Bandwidth, Error> {
        let link = te_db
            .component_link(out_if)
            .ok_or(Error::ComponentLinkNotFound(out_if))?;
        let sim = self.without_tighter_holdings(link, owner, priority)?;
        Ok(sim
            .unreserved_from(priority)
            .saturating_sub(link.unreserved_from(priority)))
    }

    // Decides how much additional bandwidth a request needs on an interface,
    // and the band down to which holders must be preempted to obtain it.
    //
    // Bandwidth is held at `hold`. Holders looser than `setup` may be
    // preempted to make room.
    pub fn calc_actual_allocation(
        &self,
        te_db: &TeDatabase,
        owner: &OwnerKey,
        out_if: IfIndex,
        requested_bw: Bandwidth,
        setup: Priority,
        hold: Priority,
    ) -> Result<(Bandwidth, Option<Priority>), Error> {
        let link = te_db
            .component_link(out_if)
            .ok_or(Error::ComponentLinkNotFound(out_if))?;
        let owned = self
            .entry(owner, out_if, hold)
            .map(|entry| entry.total())
            .unwrap_or(0);
        let sim = self.without_tighter_holdings(link, owner, hold)?;
        let efficient = sim
            .unreserved_from(hold)
            .saturating_sub(link.unreserved_from(hold));

        if owned + efficient >= requested_bw {
            return Ok((0, None));
        }
        let gap = requested_bw - owned;
        if link.unreserved_from(hold) + efficient >= gap {
            return Ok((gap, None));
        }

        // Preemption can only make room beyond the setup priority.
        if sim.admissible(hold, setup) < gap {
            return Err(Error::AdmissionDenied(out_if, setup, gap));
        }
        let shortage = gap - sim.unreserved_from(hold);
        match self.preemption_useful(out_if, setup, shortage) {
            Some((priority, _)) => Ok((gap, Some(priority))),
            None => Err(Error::AdmissionDenied(out_if, setup, gap)),
        }
    }

    // Accumulates what holders looser than `setup` hold on the interface,
    // loosest band first, until `required_bw` is covered.
    //
    // Returns the band at which the requirement was met along with the
    // accumulated amount.
    pub fn preemption_useful(
        &self,
        out_if: IfIndex,
        setup: Priority,
        required_bw: Bandwidth,
    ) -> Option<(Priority, Bandwidth)> {
        let mut accumulated = 0;
        for priority in (setup + 1..=PRIORITY_LOWEST).rev() {
            accumulated += self
                .interface_holders(out_if, priority)
                .map(|(_, bw)| bw)
                .sum::<Bandwidth>();
            if accumulated >= required_bw {
                return Some((priority, accumulated));
            }
        }
        None
    }

    fn without_tighter_holdings(
        &self,
        link: &ComponentLink,
        owner: &OwnerKey,
        priority: Priority,
    ) -> Result<ComponentLink, Error> {
        let mut sim = link.clone();
        for (tighter, entry) in self.owner_entries(owner).filter(|(p, entry)| {
            *p < priority && entry.out_if == link.ifindex
        }) {
            sim.release(entry.total(), tighter)?;
        }
        Ok(sim)
    }
}
