//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::error::{Error, Inconsistency};
use crate::instance::InstanceChannelsTx;
use crate::tasks::messages::input::PreemptedMsg;
use crate::tasks::messages::output::TeLinkBwUpdMsg;
use crate::te::{
    Bandwidth, IfIndex, PRIORITY_LEVELS, Priority, TeDatabase, TeLinkId,
};
use crate::timers::{TimerKey, Timers};
use crate::tunnel::{LspKey, TunnelKey};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum ResvStyle {
    FixedFilter,
    #[default]
    SharedExplicit,
}

// Identifies who holds bandwidth.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct OwnerKey {
    pub dst: Ipv4Addr,
    pub tunnel_id: u16,
    pub ext_tunnel_id: Ipv4Addr,
    // Absent under shared reservation styles.
    pub lsp_id: Option<u16>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BwOwnerEntry {
    pub te_link: TeLinkId,
    pub out_if: IfIndex,
    pub bw: Bandwidth,
    pub pre_alloc_bw: Bandwidth,
    // Part of the holding that overlaps with looser holders.
    pub overlap_bw: Bandwidth,
    pub hold_timer: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BwOwnerRecord {
    pub entries: Vec<BwOwnerEntry>,
}

// Owner-indexed bandwidth bookkeeping, one band per priority.
#[derive(Debug)]
pub struct Ledger {
    owners: [BTreeMap<OwnerKey, BwOwnerRecord>; PRIORITY_LEVELS],
    // Total held per (interface, owner), for preemption scans.
    if_index: [BTreeMap<(IfIndex, OwnerKey), Bandwidth>; PRIORITY_LEVELS],
    hold_interval: Duration,
}

// Collaborators every ledger mutation needs.
pub struct LedgerCxt<'a> {
    pub te_db: &'a mut TeDatabase,
    pub timers: &'a mut Timers,
    pub tx: &'a InstanceChannelsTx,
}

// ===== impl OwnerKey =====

impl OwnerKey {
    const MIN: OwnerKey = OwnerKey {
        dst: Ipv4Addr::UNSPECIFIED,
        tunnel_id: 0,
        ext_tunnel_id: Ipv4Addr::UNSPECIFIED,
        lsp_id: None,
    };

    pub fn new(lsp: &LspKey, style: ResvStyle) -> OwnerKey {
        OwnerKey {
            dst: lsp.tunnel.dst,
            tunnel_id: lsp.tunnel.tunnel_id,
            ext_tunnel_id: lsp.tunnel.src,
            lsp_id: match style {
                ResvStyle::FixedFilter => Some(lsp.lsp_id),
                ResvStyle::SharedExplicit => None,
            },
        }
    }

    pub fn tunnel(&self) -> TunnelKey {
        TunnelKey {
            dst: self.dst,
            tunnel_id: self.tunnel_id,
            src: self.ext_tunnel_id,
        }
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tunnel())?;
        if let Some(lsp_id) = self.lsp_id {
            write!(f, "/{lsp_id}")?;
        }
        Ok(())
    }
}

// ===== impl BwOwnerEntry =====

impl BwOwnerEntry {
    pub fn total(&self) -> Bandwidth {
        self.bw + self.pre_alloc_bw
    }
}

// ===== impl Ledger =====

impl Ledger {
    pub fn new(hold_interval: Duration) -> Ledger {
        Ledger {
            owners: Default::default(),
            if_index: Default::default(),
            hold_interval,
        }
    }

    pub fn entry(
        &self,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Option<&BwOwnerEntry> {
        self.owners[priority as usize]
            .get(owner)?
            .entries
            .iter()
            .find(|entry| entry.out_if == out_if)
    }

    // All entries held by an owner, tightest priority first.
    pub fn owner_entries(
        &self,
        owner: &OwnerKey,
    ) -> impl Iterator<Item = (Priority, &BwOwnerEntry)> + '_ {
        let owner = *owner;
        self.owners.iter().enumerate().flat_map(move |(priority, owners)| {
            owners
                .get(&owner)
                .into_iter()
                .flat_map(|record| record.entries.iter())
                .map(move |entry| (priority as Priority, entry))
        })
    }

    // Owners holding bandwidth on an interface at the given priority.
    pub fn interface_holders(
        &self,
        out_if: IfIndex,
        priority: Priority,
    ) -> impl Iterator<Item = (&OwnerKey, Bandwidth)> + '_ {
        self.if_index[priority as usize]
            .range((out_if, OwnerKey::MIN)..)
            .take_while(move |((ifindex, _), _)| *ifindex == out_if)
            .map(|((_, owner), bw)| (owner, *bw))
    }

    pub fn owns_anything(&self, owner: &OwnerKey) -> bool {
        self.owners.iter().any(|owners| owners.contains_key(owner))
    }

    // Extends or shrinks the provisional hold of an owner toward
    // `requested_bw` (committed plus provisional) and (re)starts its hold
    // timer.
    pub(crate) fn provisional_reserve(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        owner: &OwnerKey,
        te_link: TeLinkId,
        out_if: IfIndex,
        requested_bw: Bandwidth,
        priority: Priority,
    ) -> Result<(), Error> {
        let link = cxt.te_db.component_link_mut(out_if)?;
        let held = self
            .entry(owner, out_if, priority)
            .map(BwOwnerEntry::total);

        match held {
            Some(held) if requested_bw > held => {
                let delta = requested_bw - held;
                let overlap_bw = link.allocate(delta, priority)?;
                let entry = self.entry_mut(owner, out_if, priority)?;
                entry.pre_alloc_bw += delta;
                entry.overlap_bw += overlap_bw;
                self.index_add(out_if, owner, priority, delta);
            }
            Some(held) => {
                let entry = self.entry_mut(owner, out_if, priority)?;
                let shrink = (held - requested_bw).min(entry.pre_alloc_bw);
                if shrink > 0 {
                    link.release(shrink, priority)?;
                    entry.pre_alloc_bw -= shrink;
                    entry.overlap_bw = entry.overlap_bw.saturating_sub(shrink);
                    self.index_sub(out_if, owner, priority, shrink);
                }
            }
            None if requested_bw == 0 => return Ok(()),
            None => {
                // Room for the entry is secured before touching the link, so
                // that an allocation failure leaves everything unchanged.
                let record = self.owners[priority as usize]
                    .entry(*owner)
                    .or_default();
                record.entries.try_reserve(1)?;
                let overlap_bw = match link.allocate(requested_bw, priority) {
                    Ok(overlap_bw) => overlap_bw,
                    Err(error) => {
                        self.remove_record_if_empty(owner, priority);
                        return Err(error);
                    }
                };
                record.entries.push(BwOwnerEntry {
                    te_link,
                    out_if,
                    bw: 0,
                    pre_alloc_bw: requested_bw,
                    overlap_bw,
                    hold_timer: false,
                });
                self.index_add(out_if, owner, priority, requested_bw);
            }
        }
        Debug::LedgerReserve(owner, out_if, priority, requested_bw).log();

        let entry = self.entry_mut(owner, out_if, priority)?;
        let key = hold_timer_key(owner, te_link, out_if, priority);
        if entry.total() == 0 {
            self.remove_entry(cxt, owner, out_if, priority)?;
        } else if entry.pre_alloc_bw > 0 {
            entry.hold_timer = true;
            cxt.timers.start(key, self.hold_interval);
        } else {
            entry.hold_timer = false;
            cxt.timers.stop(&key);
        }
        te_link_feedback(cxt, te_link);
        Ok(())
    }

    // Turns the owner's hold on the interface into a committed reservation
    // of `confirmed_bw` at the `priority` hold priority.
    //
    // Holdings of the same owner at other priorities on the interface are
    // cancelled. When the reservation is still short, holders looser than
    // the `setup` priority are preempted until it is covered.
    pub(crate) fn commit(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        owner: &OwnerKey,
        te_link: TeLinkId,
        out_if: IfIndex,
        confirmed_bw: Bandwidth,
        priority: Priority,
        setup: Priority,
    ) -> Result<(), Error> {
        let link = cxt
            .te_db
            .component_link(out_if)
            .ok_or(Error::ComponentLinkNotFound(out_if))?;
        let held = self
            .entry(owner, out_if, priority)
            .map(BwOwnerEntry::total)
            .unwrap_or(0);
        let others = self.other_priorities(owner, out_if, priority);

        // Check feasibility before mutating anything.
        if confirmed_bw > held {
            let extra = confirmed_bw - held;
            let mut sim = link.clone();
            for (other_prio, other_bw) in &others {
                sim.release(*other_bw, *other_prio)?;
            }
            if sim.admissible(priority, setup) < extra {
                return Err(Error::AdmissionDenied(out_if, priority, extra));
            }
            let free = sim.unreserved_from(priority);
            if free < extra
                && self
                    .preemption_useful(out_if, setup, extra - free)
                    .is_none()
            {
                return Err(Error::AdmissionDenied(out_if, priority, extra));
            }
        }
        if self.entry(owner, out_if, priority).is_none() {
            let record = self.owners[priority as usize]
                .entry(*owner)
                .or_default();
            record.entries.try_reserve(1)?;
            record.entries.push(BwOwnerEntry {
                te_link,
                out_if,
                bw: 0,
                pre_alloc_bw: 0,
                overlap_bw: 0,
                hold_timer: false,
            });
        }

        // An owner holds at most one priority per interface.
        for (other_prio, _) in others {
            self.remove_entry(cxt, owner, out_if, other_prio)?;
        }

        let link = cxt.te_db.component_link_mut(out_if)?;
        let entry = self.entry_mut(owner, out_if, priority)?;
        if confirmed_bw < held {
            let shrink = held - confirmed_bw;
            link.release(shrink, priority)?;
            entry.overlap_bw = entry.overlap_bw.saturating_sub(shrink);
            self.index_sub(out_if, owner, priority, shrink);
        } else if confirmed_bw > held {
            entry.overlap_bw += link.allocate(confirmed_bw - held, priority)?;
            self.index_add(out_if, owner, priority, confirmed_bw - held);
        }
        let entry = self.entry_mut(owner, out_if, priority)?;
        let shortfall = entry.overlap_bw;
        entry.bw = confirmed_bw;
        entry.pre_alloc_bw = 0;
        entry.overlap_bw = 0;
        entry.hold_timer = false;
        cxt.timers
            .stop(&hold_timer_key(owner, te_link, out_if, priority));
        if confirmed_bw == 0 {
            self.remove_entry(cxt, owner, out_if, priority)?;
        }
        Debug::LedgerCommit(owner, out_if, priority, confirmed_bw).log();

        // Preempt whoever the reservation itself overlaps with.
        self.resolve_overlap(cxt, owner, out_if, priority, setup, shortfall)?;

        te_link_feedback(cxt, te_link);
        Ok(())
    }

    // Releases everything an owner holds on the interface at the given
    // priority. Releasing an absent entry is a no-op.
    pub(crate) fn release(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Result<(), Error> {
        let Some(entry) = self.entry(owner, out_if, priority) else {
            return Ok(());
        };
        let te_link = entry.te_link;

        self.remove_entry(cxt, owner, out_if, priority)?;
        Debug::LedgerRelease(owner, out_if, priority).log();
        te_link_feedback(cxt, te_link);
        Ok(())
    }

    // Reclaims the unconfirmed part of a reservation once its hold timer
    // fires.
    pub(crate) fn hold_timer_expiry(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Result<(), Error> {
        let Some(entry) = self.entry(owner, out_if, priority) else {
            return Ok(());
        };
        let te_link = entry.te_link;
        let pre_alloc_bw = entry.pre_alloc_bw;
        let bw = entry.bw;

        Debug::HoldTimerExpiry(owner, out_if, priority, pre_alloc_bw).log();
        if bw == 0 {
            // Nothing was confirmed, the whole entry goes away.
            self.remove_entry(cxt, owner, out_if, priority)?;
        } else {
            if pre_alloc_bw > 0 {
                cxt.te_db
                    .component_link_mut(out_if)?
                    .release(pre_alloc_bw, priority)?;
                self.index_sub(out_if, owner, priority, pre_alloc_bw);
            }
            let entry = self.entry_mut(owner, out_if, priority)?;
            entry.pre_alloc_bw = 0;
            entry.overlap_bw = entry.overlap_bw.saturating_sub(pre_alloc_bw);
            entry.hold_timer = false;
        }
        te_link_feedback(cxt, te_link);
        Ok(())
    }

    // Takes one holder at `preempted_prio` off the interface.
    //
    // Holders are taken in index order. When none is found at the requested
    // band, tighter bands down to the one right after the preemptor are
    // searched. Returns the amount released.
    pub(crate) fn preempt(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        preemptor: &OwnerKey,
        out_if: IfIndex,
        preemptor_prio: Priority,
        preempted_prio: Priority,
        bw: Bandwidth,
    ) -> Result<Bandwidth, Error> {
        let Some((victim, victim_prio)) = (preemptor_prio + 1
            ..=preempted_prio)
            .rev()
            .find_map(|priority| {
                self.interface_holders(out_if, priority)
                    .next()
                    .map(|(owner, _)| (*owner, priority))
            })
        else {
            return Err(Error::LedgerInconsistency(
                Inconsistency::NoPreemptionCandidate {
                    ifindex: out_if,
                    priority: preempted_prio,
                },
            ));
        };
        debug_assert!(victim_prio > preemptor_prio);

        let Some(entry) = self.entry(&victim, out_if, victim_prio) else {
            return Err(Error::LedgerInconsistency(
                Inconsistency::IndexMismatch {
                    ifindex: out_if,
                    priority: victim_prio,
                    owner: victim,
                },
            ));
        };
        let te_link = entry.te_link;
        let released = entry.total();

        Debug::Preempt(preemptor, &victim, out_if, victim_prio, bw).log();
        self.remove_entry(cxt, &victim, out_if, victim_prio)?;
        if victim != *preemptor {
            let msg = PreemptedMsg {
                owner: victim,
                te_link,
                out_if,
                priority: victim_prio,
            };
            let _ = cxt.tx.protocol_input.preempted.send(msg);
        }
        Ok(released)
    }

    // Takes every holder off an interface that is going away.
    pub(crate) fn evict_interface(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        out_if: IfIndex,
    ) -> Result<(), Error> {
        for priority in 0..PRIORITY_LEVELS as Priority {
            let holders = self
                .interface_holders(out_if, priority)
                .map(|(owner, _)| *owner)
                .collect::<Vec<_>>();
            for owner in holders {
                let Some(entry) = self.entry(&owner, out_if, priority) else {
                    continue;
                };
                let msg = PreemptedMsg {
                    owner,
                    te_link: entry.te_link,
                    out_if,
                    priority,
                };
                self.remove_entry(cxt, &owner, out_if, priority)?;
                let _ = cxt.tx.protocol_input.preempted.send(msg);
            }
        }
        Ok(())
    }

    // Preempts holders looser than `setup` until `shortfall` units of the
    // row's overlap are backed by free capacity. Overlap left by other
    // owners of the row is theirs to resolve.
    fn resolve_overlap(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
        setup: Priority,
        mut shortfall: Bandwidth,
    ) -> Result<(), Error> {
        loop {
            let link = cxt
                .te_db
                .component_link(out_if)
                .ok_or(Error::ComponentLinkNotFound(out_if))?;
            let overlap = link.overlap_total(priority);
            let needed = shortfall.min(overlap);
            if needed == 0 {
                return Ok(());
            }
            let Some((band, _)) = link.overlap_beyond(priority, setup) else {
                return Ok(());
            };
            self.preempt(cxt, owner, out_if, setup, band, needed)?;

            let link = cxt
                .te_db
                .component_link(out_if)
                .ok_or(Error::ComponentLinkNotFound(out_if))?;
            let lifted = overlap.saturating_sub(link.overlap_total(priority));
            shortfall = shortfall.saturating_sub(lifted);
        }
    }

    // Bandwidth the owner holds on the interface at other priorities.
    fn other_priorities(
        &self,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Vec<(Priority, Bandwidth)> {
        self.owner_entries(owner)
            .filter(|(other_prio, entry)| {
                *other_prio != priority && entry.out_if == out_if
            })
            .map(|(other_prio, entry)| (other_prio, entry.total()))
            .collect()
    }

    fn entry_mut(
        &mut self,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Result<&mut BwOwnerEntry, Error> {
        self.owners[priority as usize]
            .get_mut(owner)
            .and_then(|record| {
                record.entries.iter_mut().find(|entry| entry.out_if == out_if)
            })
            .ok_or(Error::LedgerInconsistency(
                Inconsistency::EntryNotFound {
                    owner: *owner,
                    ifindex: out_if,
                    priority,
                },
            ))
    }

    // Releases whatever the entry holds and forgets about it.
    fn remove_entry(
        &mut self,
        cxt: &mut LedgerCxt<'_>,
        owner: &OwnerKey,
        out_if: IfIndex,
        priority: Priority,
    ) -> Result<(), Error> {
        let Some(record) = self.owners[priority as usize].get_mut(owner) else {
            return Ok(());
        };
        let Some(pos) = record
            .entries
            .iter()
            .position(|entry| entry.out_if == out_if)
        else {
            return Ok(());
        };

        let total = record.entries[pos].total();
        let te_link = record.entries[pos].te_link;
        if total > 0 {
            cxt.te_db
                .component_link_mut(out_if)?
                .release(total, priority)?;
        }
        record.entries.remove(pos);
        self.remove_record_if_empty(owner, priority);
        self.index_sub(out_if, owner, priority, total);
        cxt.timers
            .stop(&hold_timer_key(owner, te_link, out_if, priority));
        Ok(())
    }

    fn remove_record_if_empty(&mut self, owner: &OwnerKey, priority: Priority) {
        let owners = &mut self.owners[priority as usize];
        if owners
            .get(owner)
            .is_some_and(|record| record.entries.is_empty())
        {
            owners.remove(owner);
        }
    }

    fn index_add(
        &mut self,
        out_if: IfIndex,
        owner: &OwnerKey,
        priority: Priority,
        bw: Bandwidth,
    ) {
        *self.if_index[priority as usize]
            .entry((out_if, *owner))
            .or_default() += bw;
    }

    fn index_sub(
        &mut self,
        out_if: IfIndex,
        owner: &OwnerKey,
        priority: Priority,
        bw: Bandwidth,
    ) {
        let index = &mut self.if_index[priority as usize];
        if let Some(held) = index.get_mut(&(out_if, *owner)) {
            *held = held.saturating_sub(bw);
            if *held == 0 {
                index.remove(&(out_if, *owner));
            }
        }
    }
}

// ===== helper functions =====

fn hold_timer_key(
    owner: &OwnerKey,
    te_link: TeLinkId,
    out_if: IfIndex,
    priority: Priority,
) -> TimerKey {
    TimerKey::Hold {
        owner: *owner,
        te_link,
        out_if,
        priority,
    }
}

// Advertises the current reservable bandwidth of a TE link.
pub(crate) fn te_link_feedback(cxt: &LedgerCxt<'_>, te_link: TeLinkId) {
    if let Some(max_reservable) = cxt.te_db.max_reservable(te_link) {
        Debug::TeLinkBwUpd(&te_link, &max_reservable).log();
        let msg = TeLinkBwUpdMsg {
            te_link,
            max_reservable,
        };
        let _ = cxt.tx.te_link.send(msg);
    }
}

// ===== unit tests =====
