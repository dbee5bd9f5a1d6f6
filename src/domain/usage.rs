/// Aggregate usage of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TenantUsage {
    pub org: String,
    pub cache_count: i64,
    pub total_bytes_cached: i64,
}

impl TenantUsage {
    pub fn empty(org: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, delta: UsageDelta) {
        self.cache_count += delta.cache_count;
        self.total_bytes_cached += delta.total_bytes;
    }
}

/// Signed change to a tenant's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageDelta {
    pub cache_count: i64,
    pub total_bytes: i64,
}

impl UsageDelta {
    pub fn created(total_bytes: i64) -> Self {
        Self {
            cache_count: 1,
            total_bytes,
        }
    }

    pub fn deleted(total_bytes: i64) -> Self {
        Self {
            cache_count: -1,
            total_bytes: -total_bytes,
        }
    }

    pub fn merge(self, other: UsageDelta) -> Self {
        Self {
            cache_count: self.cache_count + other.cache_count,
            total_bytes: self.total_bytes + other.total_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cache_count == 0 && self.total_bytes == 0
    }
}
