/// Keyed by stream id and archive path. ahash, nothing here hashes untrusted input.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
