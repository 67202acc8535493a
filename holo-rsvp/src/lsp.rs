//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::config::InstanceCfg;
use crate::ledger::ResvStyle;
use crate::te::Bandwidth;
use crate::tunnel::{Hop, LspAttrs, PathRole, TunnelCfg, TunnelKey};

// User-level named LSP configuration.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct UserLspCfg {
    pub name: String,
    pub dst: Ipv4Addr,
    pub src: Ipv4Addr,
    pub bw: Bandwidth,
    pub attrs: LspAttrs,
    pub style: Option<ResvStyle>,
    // Primary path hop list. Empty means unconstrained.
    pub primary: Vec<Hop>,
    // Secondary paths, in order of preference.
    pub secondaries: Vec<SecondaryPathCfg>,
    // Overrides of the instance defaults.
    pub retry_limit: Option<u32>,
    pub retry_interval: Option<u64>,
    pub adaptivity_interval: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct SecondaryPathCfg {
    pub hops: Vec<Hop>,
    pub hot_standby: bool,
}

#[derive(Debug, new)]
pub struct UserLsp {
    pub cfg: UserLspCfg,
    pub primary: TunnelKey,
    // Tunnel realizing each secondary path, once it was tried.
    pub secondaries: Vec<Option<TunnelKey>>,
    // Tunnel currently carrying the traffic.
    pub active: TunnelKey,
}

// ===== impl UserLspCfg =====

impl UserLspCfg {
    pub(crate) fn tunnel_cfg(&self, config: &InstanceCfg) -> TunnelCfg {
        let mut cfg = TunnelCfg::from(config);
        if let Some(retry_limit) = self.retry_limit {
            cfg.retry_limit = retry_limit;
        }
        if let Some(retry_interval) = self.retry_interval {
            cfg.retry_interval = Duration::from_secs(retry_interval);
        }
        if let Some(adaptivity_interval) = self.adaptivity_interval {
            cfg.adaptivity_interval = (adaptivity_interval != 0)
                .then(|| Duration::from_secs(adaptivity_interval));
        }
        cfg
    }

    // Path configured for the given role.
    pub(crate) fn path(&self, role: PathRole) -> Vec<Hop> {
        match role {
            PathRole::Primary => self.primary.clone(),
            PathRole::Secondary { index, .. } => self
                .secondaries
                .get(index)
                .map(|secondary| secondary.hops.clone())
                .unwrap_or_default(),
        }
    }
}

// ===== impl UserLsp =====

impl UserLsp {
    // Every tunnel realizing this user LSP.
    pub fn tunnels(&self) -> impl Iterator<Item = TunnelKey> + '_ {
        std::iter::once(self.primary)
            .chain(self.secondaries.iter().flatten().copied())
    }

    pub fn hot_standby_secondaries(
        &self,
    ) -> impl Iterator<Item = TunnelKey> + '_ {
        self.secondaries
            .iter()
            .zip(self.cfg.secondaries.iter())
            .filter(|(_, cfg)| cfg.hot_standby)
            .filter_map(|(tunnel, _)| *tunnel)
    }

    // First secondary path that was never tried.
    pub(crate) fn next_untried_secondary(&self) -> Option<usize> {
        self.secondaries.iter().position(Option::is_none)
    }
}
