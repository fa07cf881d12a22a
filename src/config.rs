use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an engine instance. Built once and shared through an
/// `Arc` with every table, block load and query.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding one subdirectory per table
    pub dir: PathBuf,

    /// Records per full column block (default: 65536)
    pub chunk_size: usize,

    /// A column is value-encoded once its distinct count reaches
    /// `chunk_size / cardinality_threshold` (default: 4)
    pub cardinality_threshold: usize,

    /// Target bucket count for histograms (default: 1000)
    pub num_buckets: usize,

    /// Maximum cached regex results per string column (default: 100000)
    pub regex_cache_size: usize,

    /// Maximum groups collected per block (default: 100000)
    pub internal_result_limit: usize,

    /// Blocks scanned per batch before partial results are folded (default: 16)
    pub chunks_before_gc: usize,

    /// Ingest log file count that triggers digestion (default: 256)
    pub file_digest_threshold: usize,

    /// Ingest log size in bytes that triggers digestion (default: 2MB)
    pub size_digest_threshold: u64,

    /// Persist per-block query results (default: false)
    pub cache_queries: bool,

    /// Persist block info into table-level cache files (default: false)
    pub cache_block_info: bool,

    /// Write column and info files zstd-compressed (default: false)
    pub compress: bool,

    /// Reject extreme outliers from table-wide int stats (default: false)
    pub skip_outliers: bool,

    /// Integer column holding record timestamps
    pub time_column: Option<String>,

    /// Regex replacements applied to string columns while decoding
    pub replacements: BTreeMap<String, StrReplace>,

    /// Lock protocol settings
    pub lock: LockConfig,

    /// How often the background task checks for digestion (default: 10s)
    pub digest_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Attempts before giving up on a held lock (default: 50)
    pub tries: usize,

    /// Sleep between attempts (default: 3ms)
    pub poll_interval: Duration,

    /// How long a granted lock stays valid without renewal (default: 60s)
    pub lease: Duration,

    /// Unreadable observations before a lock counts as broken (default: 5)
    pub max_breaks: usize,
}

/// A regex replacement rule for one string column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrReplace {
    pub pattern: String,
    pub replacement: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            tries: 50,
            poll_interval: Duration::from_millis(3),
            lease: Duration::from_secs(60),
            max_breaks: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./db"),
            chunk_size: 1024 * 8 * 8,
            cardinality_threshold: 4,
            num_buckets: 1000,
            regex_cache_size: 100_000,
            internal_result_limit: 100_000,
            chunks_before_gc: 16,
            file_digest_threshold: 256,
            size_digest_threshold: 2048 * 1024, // 2MB
            cache_queries: false,
            cache_block_info: false,
            compress: false,
            skip_outliers: false,
            time_column: None,
            replacements: BTreeMap::new(),
            lock: LockConfig::default(),
            digest_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set records per block
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the bucket/value encoding divisor
    pub fn cardinality_threshold(mut self, threshold: usize) -> Self {
        self.cardinality_threshold = threshold;
        self
    }

    /// Set the target histogram bucket count
    pub fn num_buckets(mut self, buckets: usize) -> Self {
        self.num_buckets = buckets;
        self
    }

    /// Set the per-column regex cache bound
    pub fn regex_cache_size(mut self, size: usize) -> Self {
        self.regex_cache_size = size;
        self
    }

    /// Set the per-block group cap
    pub fn internal_result_limit(mut self, limit: usize) -> Self {
        self.internal_result_limit = limit;
        self
    }

    /// Set how many blocks are scanned between merges
    pub fn chunks_before_gc(mut self, chunks: usize) -> Self {
        self.chunks_before_gc = chunks;
        self
    }

    /// Set the log file count digestion threshold
    pub fn file_digest_threshold(mut self, files: usize) -> Self {
        self.file_digest_threshold = files;
        self
    }

    /// Set the log size digestion threshold in bytes
    pub fn size_digest_threshold(mut self, bytes: u64) -> Self {
        self.size_digest_threshold = bytes;
        self
    }

    /// Enable the per-block query cache
    pub fn cache_queries(mut self, enabled: bool) -> Self {
        self.cache_queries = enabled;
        self
    }

    /// Enable table-level block info cache files
    pub fn cache_block_info(mut self, enabled: bool) -> Self {
        self.cache_block_info = enabled;
        self
    }

    /// Compress column and info files
    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// Reject extreme outliers from table-wide int stats
    pub fn skip_outliers(mut self, enabled: bool) -> Self {
        self.skip_outliers = enabled;
        self
    }

    /// Set the timestamp column
    pub fn time_column(mut self, column: impl Into<String>) -> Self {
        self.time_column = Some(column.into());
        self
    }

    /// Add a decode-time replacement rule for a string column
    pub fn replacement(
        mut self,
        column: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        self.replacements.insert(
            column.into(),
            StrReplace {
                pattern: pattern.into(),
                replacement: replacement.into(),
            },
        );
        self
    }

    /// Configure the lock protocol
    pub fn lock(mut self, config: LockConfig) -> Self {
        self.lock = config;
        self
    }

    /// Set the background digestion interval
    pub fn digest_interval(mut self, interval: Duration) -> Self {
        self.digest_interval = interval;
        self
    }

    /// Distinct-value count at which a column switches to value encoding
    pub fn value_encoding_cutoff(&self) -> usize {
        (self.chunk_size / self.cardinality_threshold.max(1)).max(1)
    }
}

impl LockConfig {
    /// Set the number of grab attempts
    pub fn tries(mut self, tries: usize) -> Self {
        self.tries = tries;
        self
    }

    /// Set the sleep between attempts
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lease duration
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the unreadable-observation threshold
    pub fn max_breaks(mut self, breaks: usize) -> Self {
        self.max_breaks = breaks;
        self
    }
}

/// Parse replacement rules of the form `col:pattern:replacement`, separated
/// by `separator`. Malformed entries are ignored.
pub fn parse_replacements(separator: &str, rules: &str) -> BTreeMap<String, StrReplace> {
    let mut result = BTreeMap::new();
    if rules.is_empty() {
        return result;
    }

    for rule in rules.split(separator) {
        let tokens: Vec<&str> = rule.split(':').collect();
        if tokens.len() > 2 {
            result.insert(
                tokens[0].to_string(),
                StrReplace {
                    pattern: tokens[1].to_string(),
                    replacement: tokens[2].to_string(),
                },
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./db"));
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.cardinality_threshold, 4);
        assert_eq!(config.num_buckets, 1000);
        assert_eq!(config.internal_result_limit, 100_000);
        assert!(!config.cache_queries);

        // Lock defaults
        assert_eq!(config.lock.tries, 50);
        assert_eq!(config.lock.poll_interval, Duration::from_millis(3));
        assert_eq!(config.lock.max_breaks, 5);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .chunk_size(1000)
            .cardinality_threshold(2)
            .cache_queries(true)
            .compress(true)
            .time_column("time")
            .replacement("path", "[0-9]+", "N")
            .lock(
                LockConfig::default()
                    .tries(3)
                    .lease(Duration::from_millis(100))
                    .max_breaks(1),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.value_encoding_cutoff(), 500);
        assert!(config.cache_queries);
        assert!(config.compress);
        assert_eq!(config.time_column.as_deref(), Some("time"));
        assert_eq!(config.replacements["path"].replacement, "N");

        assert_eq!(config.lock.tries, 3);
        assert_eq!(config.lock.lease, Duration::from_millis(100));
        assert_eq!(config.lock.max_breaks, 1);
    }

    #[test]
    fn test_parse_replacements() {
        let rules = parse_replacements(",", "path:[0-9]+:N,host:\\..*:,bogus");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["path"].pattern, "[0-9]+");
        assert_eq!(rules["host"].replacement, "");
        assert!(parse_replacements(",", "").is_empty());
    }
}
