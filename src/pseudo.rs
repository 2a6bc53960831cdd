/// Virtual concatenation of a response head and body.
///
/// Sends are windowed: a window that falls entirely inside the head or the
/// body is borrowed straight from it, and only a window straddling the
/// boundary is staged through the caller's scratch buffer.
pub struct Pseudoslice<'a> {
    head: &'a [u8],
    body: &'a [u8],
}

impl<'a> Pseudoslice<'a> {
    pub fn new(head: &'a [u8], body: &'a [u8]) -> Self {
        Pseudoslice { head, body }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous view of `[start, min(end, len))`.
    ///
    /// `scratch` is only written when the range straddles the head/body
    /// boundary; it must be at least as large as the requested window.
    pub fn get<'s>(&'s self, start: usize, end: usize, scratch: &'s mut [u8]) -> &'s [u8] {
        let end = end.min(self.len());
        if start >= end {
            return &[];
        }
        let split = self.head.len();
        if end <= split {
            return &self.head[start..end];
        }
        if start >= split {
            return &self.body[start - split..end - split];
        }
        let n = end - start;
        assert!(scratch.len() >= n, "scratch too small for straddling window");
        let head_part = split - start;
        scratch[..head_part].copy_from_slice(&self.head[start..]);
        scratch[head_part..n].copy_from_slice(&self.body[..end - split]);
        &scratch[..n]
    }

    /// Stage up to `out.len()` bytes starting at `start` into `out`,
    /// returning how many were written.
    pub fn read_into(&self, start: usize, out: &mut [u8]) -> usize {
        let end = (start + out.len()).min(self.len());
        if start >= end {
            return 0;
        }
        let mut written = 0;
        let split = self.head.len();
        if start < split {
            let take = (split - start).min(end - start);
            out[..take].copy_from_slice(&self.head[start..start + take]);
            written += take;
        }
        if end > split {
            let from = start.max(split) - split;
            let take = end - split - from;
            out[written..written + take].copy_from_slice(&self.body[from..from + take]);
            written += take;
        }
        written
    }
}
