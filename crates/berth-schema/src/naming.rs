use crate::types::ContainerName;

pub const CONTAINER_PREFIX: &str = "berth";

/// At most the first eight characters of `id`.
///
/// Ids sharing an eight-character prefix map to the same container; callers
/// are expected to hand out UUIDs, which makes that collision unlikely.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// The one naming rule shared by rendering, start, status and stats.
pub fn container_name(module: &str, instance_id: &str) -> ContainerName {
    ContainerName::new(format!(
        "{CONTAINER_PREFIX}-{module}-{}",
        short_id(instance_id)
    ))
}
