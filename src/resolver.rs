//! Content resolver and cluster-state collaborators.
//!
//! Both are consumed-only interfaces per scope: this crate never implements a
//! location index or membership service, only queries one.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::hash::{ContentHash, MachineId, MachineLocation, SizeHint};

/// A request to locate peers holding `hash`.
#[derive(Clone, Debug)]
pub struct GetLocationsRequest {
    pub hash: ContentHash,
    pub recursive: bool,
}

impl GetLocationsRequest {
    pub fn single(hash: ContentHash) -> Self {
        Self {
            hash,
            recursive: false,
        }
    }
}

/// One resolver result: a hash, its known size, and the machines claiming it.
#[derive(Clone, Debug)]
pub struct ResolverResult {
    pub hash: ContentHash,
    pub size: SizeHint,
    pub machine_ids: Vec<MachineId>,
    pub operations: Vec<String>,
}

impl ResolverResult {
    /// Machines the resolver currently believes hold this content.
    pub fn existing(&self) -> &[MachineId] {
        &self.machine_ids
    }
}

/// Queries the local and global content-location indexes.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn get_locations(&self, request: GetLocationsRequest) -> Result<Vec<ResolverResult>, SessionError>;

    async fn get_single_location(&self, hash: &ContentHash) -> Result<Option<ResolverResult>, SessionError> {
        Ok(self
            .get_locations(GetLocationsRequest::single(hash.clone()))
            .await?
            .into_iter()
            .next())
    }
}

/// The cluster membership view this machine participates in.
pub trait ClusterState: Send + Sync {
    fn primary_machine_id(&self) -> MachineId;
    fn location_for(&self, id: &MachineId) -> Option<MachineLocation>;
    fn is_inactive(&self, id: &MachineId) -> bool;
}

/// Outcome of splitting resolver-reported machines against cluster state.
pub struct PartitionedLocations {
    pub active: Vec<MachineLocation>,
    pub inactive: Vec<MachineLocation>,
    pub invalid: Vec<MachineId>,
}

/// Splits machine IDs into active / inactive / invalid per the cluster-state view.
pub fn partition_locations(cluster: &dyn ClusterState, machine_ids: &[MachineId]) -> PartitionedLocations {
    let mut active = Vec::new();
    let mut inactive = Vec::new();
    let mut invalid = Vec::new();

    for id in machine_ids {
        match cluster.location_for(id) {
            None => invalid.push(*id),
            Some(location) => {
                if cluster.is_inactive(id) {
                    inactive.push(location);
                } else {
                    active.push(location);
                }
            }
        }
    }

    PartitionedLocations {
        active,
        inactive,
        invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeCluster {
        primary: MachineId,
        records: HashMap<MachineId, MachineLocation>,
        inactive: std::collections::HashSet<MachineId>,
    }

    impl ClusterState for FakeCluster {
        fn primary_machine_id(&self) -> MachineId {
            self.primary
        }
        fn location_for(&self, id: &MachineId) -> Option<MachineLocation> {
            self.records.get(id).cloned()
        }
        fn is_inactive(&self, id: &MachineId) -> bool {
            self.inactive.contains(id)
        }
    }

    #[test]
    fn partitions_active_inactive_and_invalid() {
        let cluster = FakeCluster {
            primary: MachineId(0),
            records: HashMap::from([
                (MachineId(1), MachineLocation("peer-1".into())),
                (MachineId(2), MachineLocation("peer-2".into())),
            ]),
            inactive: std::collections::HashSet::from([MachineId(2)]),
        };

        let result = partition_locations(&cluster, &[MachineId(1), MachineId(2), MachineId(3)]);
        assert_eq!(result.active, vec![MachineLocation("peer-1".into())]);
        assert_eq!(result.inactive, vec![MachineLocation("peer-2".into())]);
        assert_eq!(result.invalid, vec![MachineId(3)]);
    }
}
