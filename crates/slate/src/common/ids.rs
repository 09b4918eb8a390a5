use crate::define_id_type;

define_id_type!(NodeId, u32);
define_id_type!(PartitionId, u32);
define_id_type!(ConfigId, u32);
define_id_type!(JobId, u32);
define_id_type!(StepId, u32);
define_id_type!(BlockId, u32);

/// Numeric identity of the submitting user, as reported by the transport
/// layer after authentication.
pub type UserId = u32;
