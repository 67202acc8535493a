//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::ledger::OwnerKey;
use crate::task::TimeoutTask;
use crate::tasks;
use crate::tasks::messages::input::TimerExpiryMsg;
use crate::te::{IfIndex, Priority, TeLinkId};
use crate::tunnel::{LspKey, TunnelKey};

// Identity of a timer: what it belongs to and what it is for.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum TimerKey {
    // Bounds the lifetime of an unconfirmed reservation.
    Hold {
        owner: OwnerKey,
        te_link: TeLinkId,
        out_if: IfIndex,
        priority: Priority,
    },
    SetupTimeout(LspKey),
    ResolverRetry(LspKey),
    SetupRetry(TunnelKey),
    Adaptivity(TunnelKey),
}

// One-shot timers keyed by owner and purpose.
//
// Starting a running timer rearms it, stopping an inactive one is a no-op.
#[derive(Debug)]
pub struct Timers {
    active: BTreeMap<TimerKey, (u64, TimeoutTask)>,
    next_seqno: u64,
    timerp: Sender<TimerExpiryMsg>,
}

// ===== impl Timers =====

impl Timers {
    pub(crate) fn new(timerp: Sender<TimerExpiryMsg>) -> Timers {
        Timers {
            active: Default::default(),
            next_seqno: 0,
            timerp,
        }
    }

    pub(crate) fn start(&mut self, key: TimerKey, timeout: Duration) {
        self.next_seqno += 1;
        let task = tasks::timer(key, self.next_seqno, timeout, &self.timerp);
        self.active.insert(key, (self.next_seqno, task));
    }

    pub(crate) fn stop(&mut self, key: &TimerKey) {
        self.active.remove(key);
    }

    pub fn is_active(&self, key: &TimerKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn interval(&self, key: &TimerKey) -> Option<Duration> {
        self.active.get(key).map(|(_, task)| task.timeout())
    }

    // Consumes an expiry notification.
    //
    // Returns false when the timer was stopped or rearmed after the
    // notification was queued.
    pub(crate) fn expired(&mut self, msg: &TimerExpiryMsg) -> bool {
        match self.active.get(&msg.key) {
            Some((seqno, _)) if *seqno == msg.seqno => {
                self.active.remove(&msg.key);
                true
            }
            _ => false,
        }
    }

    // Sequence number of the running timer, used to inject expirations.
    pub fn seqno(&self, key: &TimerKey) -> Option<u64> {
        self.active.get(key).map(|(seqno, _)| *seqno)
    }
}
