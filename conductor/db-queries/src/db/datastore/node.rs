// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Node`]s.

use super::DataStore;
use crate::context::OpContext;
use crate::db::update_and_check::UpdateAndQueryResult;
use crate::db::update_and_check::UpdateStatus;
use chrono::Utc;
use conductor_common::api::external::CreateResult;
use conductor_common::api::external::DeleteResult;
use conductor_common::api::external::Error;
use conductor_common::api::external::Generation;
use conductor_common::api::external::ListResultVec;
use conductor_common::api::external::LookupResult;
use conductor_common::api::external::ResourceType;
use conductor_common::api::external::UpdateResult;
use conductor_types::node::Node;
use conductor_types::node::NodeCreate;
use conductor_types::node::NodeUpdate;
use conductor_types::node::ProvisionState;
use conductor_types::reservation::HolderId;
use conductor_types::reservation::Reservation;
use uuid::Uuid;

/// Selects nodes in [`DataStore::node_list`]
///
/// Every criterion that is `Some` must match.
#[derive(Clone, Debug, Default)]
pub struct NodeFilter {
    pub provision_states: Option<Vec<ProvisionState>>,
    pub reserved: Option<bool>,
    pub maintenance: Option<bool>,
    pub driver: Option<String>,
}

impl NodeFilter {
    /// Matches nodes in any of the given states
    pub fn in_states(states: &[ProvisionState]) -> NodeFilter {
        NodeFilter {
            provision_states: Some(states.to_vec()),
            ..Default::default()
        }
    }

    fn matches(&self, node: &Node) -> bool {
        if let Some(states) = &self.provision_states {
            if !states.contains(&node.provision_state) {
                return false;
            }
        }
        if let Some(reserved) = self.reserved {
            if node.reservation.is_some() != reserved {
                return false;
            }
        }
        if let Some(maintenance) = self.maintenance {
            if node.maintenance != maintenance {
                return false;
            }
        }
        if let Some(driver) = &self.driver {
            if &node.driver != driver {
                return false;
            }
        }
        true
    }
}

fn not_found(node_id: Uuid) -> Error {
    Error::not_found_by_id(ResourceType::Node, &node_id)
}

impl DataStore {
    /// Stores a newly-enrolled node
    pub async fn node_create(
        &self,
        opctx: &OpContext,
        params: NodeCreate,
    ) -> CreateResult<Node> {
        if params.driver.is_empty() {
            return Err(Error::missing_value("driver"));
        }

        let node_id = params.id.unwrap_or_else(Uuid::new_v4);
        let node = Node::new(node_id, params, Utc::now());
        let created = self.transaction(|tables| {
            if tables.nodes.contains_key(&node_id) {
                return Err(Error::ObjectAlreadyExists {
                    type_name: ResourceType::Node,
                    object_name: node_id.to_string(),
                });
            }
            tables.nodes.insert(node_id, node.clone());
            Ok(node)
        })?;

        debug!(
            opctx.log,
            "created node";
            "node_id" => %created.id,
            "driver" => &created.driver,
        );
        Ok(created)
    }

    pub async fn node_fetch(
        &self,
        _opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<Node> {
        self.transaction(|tables| {
            tables.nodes.get(&node_id).cloned().ok_or_else(|| not_found(node_id))
        })
    }

    /// Lists nodes matching `filter`, ordered by id
    pub async fn node_list(
        &self,
        _opctx: &OpContext,
        filter: &NodeFilter,
    ) -> ListResultVec<Node> {
        self.transaction(|tables| {
            Ok(tables
                .nodes
                .values()
                .filter(|node| filter.matches(node))
                .cloned()
                .collect())
        })
    }

    /// Removes a node from the store
    ///
    /// The caller must hold the node's exclusive lease as `holder`.  Nodes
    /// in the middle of a lifecycle pass cannot be removed unless they are in
    /// maintenance.
    pub async fn node_destroy(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        holder: &HolderId,
    ) -> DeleteResult {
        self.transaction(|tables| {
            let node =
                tables.nodes.get(&node_id).ok_or_else(|| not_found(node_id))?;
            match &node.reservation {
                Some(Reservation::Exclusive { holder: h })
                    if &h.holder == holder => {}
                Some(other) => {
                    if !other.is_held_by(holder) {
                        return Err(Error::NodeLocked {
                            node_id,
                            holder: other.describe_holders(),
                        });
                    }
                    return Err(Error::ExclusiveLockRequired { node_id });
                }
                None => return Err(Error::ExclusiveLockRequired { node_id }),
            }

            if !node.provision_state.is_deletable() && !node.maintenance {
                return Err(Error::invalid_request(&format!(
                    "cannot delete node {} in state \"{}\" unless it is in \
                    maintenance",
                    node_id, node.provision_state
                )));
            }

            tables.nodes.remove(&node_id);
            Ok(())
        })?;

        info!(opctx.log, "destroyed node"; "node_id" => %node_id);
        Ok(())
    }

    /// Replaces a node's reservation if (and only if) the node's
    /// `reservation_gen` is still `expected_gen`
    ///
    /// This is the compare-and-set primitive underneath every lease
    /// acquisition, release, upgrade, and reclamation.  Every change to the
    /// reservation advances `reservation_gen`, so the update succeeds only if
    /// nobody else changed the reservation since the caller read it.  This
    /// works like an atomic compare-and-swap instruction in the implementation
    /// of a non-distributed, single-process mutex.
    pub async fn node_reservation_cas(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        expected_gen: Generation,
        reservation: Option<Reservation>,
    ) -> UpdateResult<UpdateAndQueryResult<Node>> {
        let result = self.transaction(|tables| {
            let node = tables
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| not_found(node_id))?;
            if node.reservation_gen != expected_gen {
                return Ok(UpdateAndQueryResult {
                    status: UpdateStatus::NotUpdatedButExists,
                    found: node.clone(),
                });
            }

            node.reservation = reservation;
            node.reservation_gen = node.reservation_gen.next();
            Ok(UpdateAndQueryResult {
                status: UpdateStatus::Updated,
                found: node.clone(),
            })
        })?;

        trace!(
            opctx.log,
            "node reservation compare-and-set";
            "node_id" => %node_id,
            "expected_gen" => %expected_gen,
            "status" => ?result.status,
            "reservation_gen" => %result.found.reservation_gen,
        );
        Ok(result)
    }

    /// Writes a node's mutable data if (and only if) the node's `generation` is
    /// still `expected_gen`
    ///
    /// This is the optimistic-concurrency primitive underneath
    /// `Task::save()`.  A successful update advances `generation` and
    /// `time_updated`; if the provisioning state changed, it also moves
    /// `provision_updated_at`, which callback timeouts are measured from.
    pub async fn node_update_if_current(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        expected_gen: Generation,
        update: NodeUpdate,
    ) -> UpdateResult<UpdateAndQueryResult<Node>> {
        let result = self.transaction(|tables| {
            let node = tables
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| not_found(node_id))?;
            if node.generation != expected_gen {
                return Ok(UpdateAndQueryResult {
                    status: UpdateStatus::NotUpdatedButExists,
                    found: node.clone(),
                });
            }

            let now = Utc::now();
            if node.provision_state != update.provision_state {
                node.provision_updated_at = now;
            }
            node.apply_update(update);
            node.generation = node.generation.next();
            node.time_updated = now;
            Ok(UpdateAndQueryResult {
                status: UpdateStatus::Updated,
                found: node.clone(),
            })
        })?;

        trace!(
            opctx.log,
            "node conditional update";
            "node_id" => %node_id,
            "expected_gen" => %expected_gen,
            "status" => ?result.status,
            "generation" => %result.found.generation,
        );
        Ok(result)
    }
}
