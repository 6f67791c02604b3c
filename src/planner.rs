//! Read planner — due sensors in, batched register spans out.
//!
//! The planner unions every address word of the due sensors into a sorted
//! set and walks it once, extending the current span while the next
//! address is within the allowed gap of the span's last address and the
//! grown span still fits the batch size. Each sensor is then associated
//! with the single span that covers its full register tuple; when the
//! batch budget fragments a tuple across spans, an overlapping span is
//! emitted so the sensor still decodes from one contiguous read.

/// A contiguous register-address window issued as one protocol read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpan {
    pub start: u16,
    pub count: u16,
}

impl RegisterSpan {
    /// Whether this span covers `addr`.
    pub fn contains(&self, addr: u16) -> bool {
        addr >= self.start && u32::from(addr) < u32::from(self.start) + u32::from(self.count)
    }

    /// Whether this span covers every address of `addrs`.
    pub fn covers(&self, addrs: &[u16]) -> bool {
        addrs.iter().all(|&a| self.contains(a))
    }
}

/// One planned read: the span plus the indices (into the caller's due
/// list) of the sensors it decodes.
#[derive(Debug, Clone)]
pub struct PlannedRead {
    pub span: RegisterSpan,
    pub sensors: Vec<usize>,
}

/// Group the due sensors' register addresses into read spans.
///
/// `due` holds each sensor's address tuple. `batch_size` caps a span's
/// register count; `allow_gap` is the number of unrequested addresses
/// that may be bridged inside a span (0 still coalesces adjacent
/// registers).
pub fn plan(due: &[&[u16]], batch_size: u16, allow_gap: u16) -> Vec<PlannedRead> {
    let batch_size = batch_size.max(1);

    let mut addrs: Vec<u16> = due.iter().flat_map(|a| a.iter().copied()).collect();
    addrs.sort_unstable();
    addrs.dedup();

    // Walk the sorted set into spans.
    let mut spans: Vec<RegisterSpan> = Vec::new();
    let mut start: Option<(u16, u16)> = None; // (start, last)
    for &addr in &addrs {
        match start {
            None => start = Some((addr, addr)),
            Some((s, last)) => {
                let gap = addr - last - 1;
                let grown = u32::from(addr) - u32::from(s) + 1;
                if gap <= allow_gap && grown <= u32::from(batch_size) {
                    start = Some((s, addr));
                } else {
                    spans.push(RegisterSpan {
                        start: s,
                        count: last - s + 1,
                    });
                    start = Some((addr, addr));
                }
            }
        }
    }
    if let Some((s, last)) = start {
        spans.push(RegisterSpan {
            start: s,
            count: last - s + 1,
        });
    }

    let mut planned: Vec<PlannedRead> = spans
        .into_iter()
        .map(|span| PlannedRead {
            span,
            sensors: Vec::new(),
        })
        .collect();

    // Associate every sensor with one covering span. A tuple fragmented
    // by the batch budget gets its own overlapping span.
    for (idx, addrs) in due.iter().enumerate() {
        if addrs.is_empty() {
            continue;
        }
        match planned.iter_mut().find(|p| p.span.covers(addrs)) {
            Some(p) => p.sensors.push(idx),
            None => {
                let lo = *addrs.iter().min().unwrap_or(&0);
                let hi = *addrs.iter().max().unwrap_or(&0);
                planned.push(PlannedRead {
                    span: RegisterSpan {
                        start: lo,
                        count: hi - lo + 1,
                    },
                    sensors: vec![idx],
                });
            }
        }
    }

    // A span can end up empty when all its sensors straddled into
    // overlap spans; dropping it saves the wasted read.
    planned.retain(|p| !p.sensors.is_empty());
    planned
}
