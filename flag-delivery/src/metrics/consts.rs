// Flag cache
pub const FLAG_CACHE_HIT_COUNTER: &str = "flags_flag_cache_hit_total";
pub const FLAG_CACHE_MISS_COUNTER: &str = "flags_flag_cache_miss_total";
pub const FLAG_CACHE_COALESCED_COUNTER: &str = "flags_flag_cache_coalesced_total";
pub const FLAG_CACHE_STALE_FALLBACK_COUNTER: &str = "flags_flag_cache_stale_fallback_total";
pub const FLAG_CACHE_EMPTY_FALLBACK_COUNTER: &str = "flags_flag_cache_empty_fallback_total";
pub const FLAG_CACHE_INVALIDATIONS_COUNTER: &str = "flags_flag_cache_invalidations_total";
pub const FLAG_CACHE_ENTRIES_GAUGE: &str = "flags_flag_cache_entries";
pub const FLAG_SOURCE_ERRORS_COUNTER: &str = "flags_flag_source_errors_total";
pub const FLAG_COMPUTE_TIME: &str = "flags_compute_time";

// Database
pub const DB_OVERRIDE_READS_COUNTER: &str = "flags_db_override_reads_total";

// Stream hub
pub const STREAM_CONNECTIONS_GAUGE: &str = "flags_stream_connections";
pub const STREAM_EVENTS_SENT_COUNTER: &str = "flags_stream_events_sent_total";
pub const STREAM_EVENTS_DROPPED_COUNTER: &str = "flags_stream_events_dropped_total";
pub const STREAM_ERRORS_COUNTER: &str = "flags_stream_errors_total";

// HTTP
pub const FLAG_REQUESTS_COUNTER: &str = "flags_requests_total";
pub const FLAG_NOT_MODIFIED_COUNTER: &str = "flags_not_modified_total";
