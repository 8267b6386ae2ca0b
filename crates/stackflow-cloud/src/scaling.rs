//! Shared scaling helpers
//!
//! Standalone functions composed by the provider connectors instead of a
//! shared base type.

use crate::model::{AdjustmentType, CloudInstance, CloudResource};

/// Resources that belong to the given instances: a resource is deletable
/// when its name or bound instance id matches an instance's provider id.
/// Instances without an id (never provisioned) select nothing.
pub fn deletable_resources(
    resources: &[CloudResource],
    instances: &[CloudInstance],
) -> Vec<CloudResource> {
    let mut result = Vec::new();
    for instance in instances {
        let Some(instance_id) = instance.instance_id() else {
            continue;
        };
        for resource in resources {
            let name_matches = resource.name.eq_ignore_ascii_case(instance_id);
            let id_matches = resource
                .instance_id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(instance_id));
            if name_matches || id_matches {
                result.push(resource.clone());
            }
        }
    }
    tracing::debug!("collected {} deletable resource(s) for downscale", result.len());
    result
}

/// Whether a launch that brought up `created` of `requested` nodes satisfies
/// the caller's adjustment policy.
pub fn meets_adjustment(
    created: usize,
    requested: usize,
    adjustment: AdjustmentType,
    threshold: u64,
) -> bool {
    match adjustment {
        AdjustmentType::Exact => created as u64 >= threshold,
        AdjustmentType::Percentage => {
            if requested == 0 {
                return true;
            }
            (created * 100) as u64 >= threshold * requested as u64
        }
        AdjustmentType::BestEffort => true,
    }
}
