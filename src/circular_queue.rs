/// Fixed capacity ring. Once full, every push overwrites the oldest slot.
#[derive(Debug, Clone)]
pub struct CircularQueue<T> {
    buf: Vec<T>,
    cap: usize,
    // slot the next push writes to once `buf` is full
    next: usize,
}

impl<T> CircularQueue<T> {
    /// A zero capacity is bumped to one.
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);

        Self {
            buf: Vec::with_capacity(cap),
            cap,
            next: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.buf.len() < self.cap {
            self.buf.push(item);
        } else {
            self.buf[self.next] = item;
            self.next = (self.next + 1) % self.cap;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Items in storage order, not push order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.buf.iter()
    }
}
