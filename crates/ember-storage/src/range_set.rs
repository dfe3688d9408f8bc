/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Sorted, disjoint byte ranges; touching ranges are merged on insert.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        // First range that ends after `start`.
        let idx = self.ranges.partition_point(|r| r.end <= start);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start <= start && r.end >= end)
    }

    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = ByteRange::new(start, end);
        let lo = self.ranges.partition_point(|r| r.end < start);
        let mut hi = lo;
        while hi < self.ranges.len() && self.ranges[hi].start <= end {
            merged.start = merged.start.min(self.ranges[hi].start);
            merged.end = merged.end.max(self.ranges[hi].end);
            hi += 1;
        }
        self.ranges.splice(lo..hi, std::iter::once(merged));
    }

    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= start || r.start >= end {
                out.push(r);
                continue;
            }
            if r.start < start {
                out.push(ByteRange::new(r.start, start));
            }
            if r.end > end {
                out.push(ByteRange::new(end, r.end));
            }
        }
        self.ranges = out;
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
