//! URL-length aware splitting of id lists.
//!
//! Ids are joined into a comma-separated query value after a fixed prefix.
//! Each id costs its length plus one separator; a batch is closed as soon as
//! the next id would push the running length past the limit.

/// Splits ids into batches that keep `prefix + ids` within `max_length`.
#[derive(Debug, Clone)]
pub struct RequestChunker {
    max_length: usize,
    prefix_length: usize,
}

impl RequestChunker {
    pub fn new(max_length: usize, fixed_prefix: &str) -> Self {
        Self {
            max_length,
            prefix_length: fixed_prefix.len(),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Lazily split `ids` into non-empty batches, preserving order.
    ///
    /// An id that alone exceeds the limit still gets a batch of its own.
    pub fn chunks<'a, S: AsRef<str>>(&self, ids: &'a [S]) -> Chunks<'a, S> {
        Chunks {
            ids,
            position: 0,
            max_length: self.max_length,
            prefix_length: self.prefix_length,
        }
    }

    /// Rough batch count from the average id length. Advisory only.
    pub fn estimate_batch_count<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let total_length: usize = ids.iter().map(|id| id.as_ref().len()).sum();
        let average = total_length as f64 / ids.len() as f64;
        let budget = self.max_length.saturating_sub(self.prefix_length) as f64;
        let per_batch = ((budget / (average + 1.0)).floor() as usize).max(1);

        ids.len().div_ceil(per_batch)
    }
}

/// Iterator returned by [`RequestChunker::chunks`].
#[derive(Debug)]
pub struct Chunks<'a, S> {
    ids: &'a [S],
    position: usize,
    max_length: usize,
    prefix_length: usize,
}

impl<'a, S: AsRef<str>> Iterator for Chunks<'a, S> {
    type Item = Vec<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = &self.ids[self.position..];
        let first = remaining.first()?.as_ref();

        let mut batch = vec![first];
        let mut length = self.prefix_length + first.len() + 1;

        for id in &remaining[1..] {
            let id = id.as_ref();
            let extended = length + id.len() + 1;
            if extended > self.max_length {
                break;
            }
            batch.push(id);
            length = extended;
        }

        self.position += batch.len();
        Some(batch)
    }
}
