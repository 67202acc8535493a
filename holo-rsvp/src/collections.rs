//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use generational_arena::{Arena, Index};

use crate::error::Error;
use crate::tunnel::{Tunnel, TunnelKey};

pub type TunnelIndex = Index;

#[derive(Debug, Default)]
pub struct Tunnels {
    // Tunnel arena.
    arena: Arena<Tunnel>,
    // Tunnel binary tree keyed by destination, tunnel ID and source (1:1).
    key_tree: BTreeMap<TunnelKey, TunnelIndex>,
    // Tunnel binary tree keyed by user LSP name (1:N).
    name_tree: BTreeMap<String, BTreeMap<TunnelKey, TunnelIndex>>,
}

// ===== impl Tunnels =====

impl Tunnels {
    pub(crate) fn insert(
        &mut self,
        tunnel: Tunnel,
    ) -> (TunnelIndex, &mut Tunnel) {
        // Check for existing entry first.
        if let Some(tunnel_idx) = self.key_tree.get(&tunnel.key).copied() {
            let tunnel = &mut self.arena[tunnel_idx];
            return (tunnel_idx, tunnel);
        }

        // Insert tunnel into the arena.
        let tunnel_idx = self.arena.insert(tunnel);

        // Link tunnel to different collections.
        let tunnel = &mut self.arena[tunnel_idx];
        self.key_tree.insert(tunnel.key, tunnel_idx);
        if let Some(name) = &tunnel.name {
            self.name_tree
                .entry(name.clone())
                .or_default()
                .insert(tunnel.key, tunnel_idx);
        }

        (tunnel_idx, tunnel)
    }

    pub(crate) fn delete(&mut self, tunnel_idx: TunnelIndex) -> Option<Tunnel> {
        let tunnel = self.arena.remove(tunnel_idx)?;

        // Unlink tunnel from different collections.
        self.key_tree.remove(&tunnel.key);
        if let Some(name) = &tunnel.name {
            if let Some(tunnels) = self.name_tree.get_mut(name) {
                tunnels.remove(&tunnel.key);
                if tunnels.is_empty() {
                    self.name_tree.remove(name);
                }
            }
        }

        Some(tunnel)
    }

    // Returns a reference to the tunnel corresponding to the given key.
    pub fn get_by_key(
        &self,
        key: &TunnelKey,
    ) -> Option<(TunnelIndex, &Tunnel)> {
        self.key_tree
            .get(key)
            .copied()
            .map(|tunnel_idx| (tunnel_idx, &self.arena[tunnel_idx]))
    }

    // Returns a mutable reference to the tunnel corresponding to the given
    // key.
    pub(crate) fn get_mut_by_key(
        &mut self,
        key: &TunnelKey,
    ) -> Option<(TunnelIndex, &mut Tunnel)> {
        self.key_tree
            .get(key)
            .copied()
            .map(move |tunnel_idx| (tunnel_idx, &mut self.arena[tunnel_idx]))
    }

    // Returns an iterator over the tunnels of a user LSP.
    pub fn get_by_name<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = &'a Tunnel> + 'a {
        self.name_tree
            .get(name)
            .into_iter()
            .flat_map(|tunnels| tunnels.values())
            .map(|tunnel_idx| &self.arena[*tunnel_idx])
    }

    // Returns an iterator visiting all tunnels, ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = &Tunnel> + '_ {
        self.key_tree
            .values()
            .map(|tunnel_idx| &self.arena[*tunnel_idx])
    }

    // Picks the first unused tunnel ID for the given endpoints.
    pub(crate) fn alloc_tunnel_id(
        &self,
        dst: Ipv4Addr,
        src: Ipv4Addr,
        range: RangeInclusive<u16>,
    ) -> Result<u16, Error> {
        range
            .into_iter()
            .find(|tunnel_id| {
                let key = TunnelKey {
                    dst,
                    tunnel_id: *tunnel_id,
                    src,
                };
                !self.key_tree.contains_key(&key)
            })
            .ok_or(Error::TunnelIdExhausted(dst, src))
    }
}
