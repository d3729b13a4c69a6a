// ==== Consumer loop metrics ====
/// Counter for batches handed to the per-batch routine
pub const CONSUMER_BATCHES_PROCESSED: &str = "message_consumer_batches_processed_total";

/// Counter for messages processed in simple mode
pub const CONSUMER_MESSAGES_PROCESSED: &str = "message_consumer_messages_processed_total";

/// Counter for batches delivered for a topic with no subscription
pub const CONSUMER_UNSUBSCRIBED_BATCHES: &str = "message_consumer_unsubscribed_batches_total";

/// Counter for heartbeat failures, labeled by whether they triggered a resync
pub const CONSUMER_HEARTBEAT_FAILURES: &str = "message_consumer_heartbeat_failures_total";

// ==== Resync metrics ====
/// Counter for broadcast resync rounds issued
pub const RESYNC_ROUNDS: &str = "message_consumer_resync_rounds_total";

/// Counter for forced commits performed at a resync poll point
pub const RESYNC_FORCED_COMMITS: &str = "message_consumer_forced_commits_total";

/// Gauge for currently registered synchronizer slots
pub const RESYNC_ACTIVE_SLOTS: &str = "message_consumer_resync_active_slots";
