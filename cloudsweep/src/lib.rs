/*!
Cleans up the debris cloud-sync services leave behind: conflict copies,
stale parallel-run fragments and regenerable caches
*/

pub mod core;
