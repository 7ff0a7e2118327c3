use crate::work::Record;

/// Ordered record accumulator for one unit of work.
#[derive(Debug)]
pub struct Batch {
    size: usize,
    records: Vec<Record>,
}

impl Batch {
    /// A size of zero is treated as one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            records: Vec::with_capacity(size.min(1024)),
        }
    }

    /// Adds a record. Returns the full batch once `size` records are held.
    pub fn push(&mut self, record: Record) -> Option<Vec<Record>> {
        self.records.push(record);
        if self.records.len() >= self.size {
            Some(std::mem::take(&mut self.records))
        } else {
            None
        }
    }

    /// Takes whatever is left, if anything.
    pub fn take_remainder(&mut self) -> Option<Vec<Record>> {
        if self.records.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.records))
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
