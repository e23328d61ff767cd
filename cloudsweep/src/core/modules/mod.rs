/*!
Built-in detection strategies
*/

mod ephemeral_caches;
mod parallel_artifacts;
mod sync_conflicts;

pub use ephemeral_caches::EphemeralCachesModule;
pub use parallel_artifacts::ParallelArtifactsModule;
pub use sync_conflicts::{ConflictDescriptor, SyncConflictsModule};
