//! Dirty byte ranges that host writes have produced but no uploaded part
//! reflects yet.
//!
//! Intervals are kept sorted by start, pairwise non-touching; insertion
//! coalesces any interval it touches or overlaps. Each interval carries a
//! recency tag so the most recently written one can be found for the
//! opportunistic boundary flush.

use crate::upload::ByteRange;

#[derive(Debug, Clone, Copy)]
struct UntreatedPart {
    start: u64,
    size: u64,
    tag: u64,
}

impl UntreatedPart {
    #[inline]
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Debug, Default)]
pub struct UntreatedParts {
    parts: Vec<UntreatedPart>,
    next_tag: u64,
}

impl UntreatedParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Insert `[start, start + size)`, merging every interval it touches or
    /// overlaps. The merged interval becomes the most recently written one.
    pub fn add(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.next_tag += 1;
        let tag = self.next_tag;

        let mut merged_start = start;
        let mut merged_end = start + size;
        self.parts.retain(|part| {
            // Closed comparison so adjacent intervals coalesce too.
            let touches = part.start <= merged_end && merged_start <= part.end();
            if touches {
                merged_start = merged_start.min(part.start);
                merged_end = merged_end.max(part.end());
            }
            !touches
        });

        let idx = self.parts.partition_point(|part| part.start < merged_start);
        self.parts.insert(
            idx,
            UntreatedPart {
                start: merged_start,
                size: merged_end - merged_start,
                tag,
            },
        );
    }

    /// Independent snapshot, sorted by start. The planner iterates this so
    /// the live set is never held across long operations.
    pub fn duplicate(&self) -> Vec<ByteRange> {
        self.parts
            .iter()
            .map(|part| ByteRange::new(part.start, part.size))
            .collect()
    }

    /// The most recently written interval, if any.
    pub fn get_last(&self) -> Option<ByteRange> {
        self.parts
            .iter()
            .max_by_key(|part| part.tag)
            .map(|part| ByteRange::new(part.start, part.size))
    }

    /// Remove the most recently written interval and re-insert the
    /// remainders that fell outside the flushed window. Returns false when
    /// there is no last interval to replace.
    pub fn replace_last(&mut self, front: Option<ByteRange>, back: Option<ByteRange>) -> bool {
        let Some(idx) = self
            .parts
            .iter()
            .enumerate()
            .max_by_key(|(_, part)| part.tag)
            .map(|(idx, _)| idx)
        else {
            return false;
        };
        self.parts.remove(idx);

        if let Some(front) = front {
            self.add(front.start, front.size);
        }
        if let Some(back) = back {
            self.add(back.start, back.size);
        }
        true
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u64, u64)> {
        self.parts.iter().map(|p| (p.start, p.size)).collect()
    }
}
