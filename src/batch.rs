//! Just-in-time batch building.
//!
//! A batch is a contiguous byte buffer of newline-terminated lines for a
//! window of items. Formatting runs here, interleaved with the schedulers'
//! I/O, so line production overlaps engine work. The fill loop honors three
//! caps: a line count, a byte budget (so a batch never exceeds the pipe
//! capacity in non-blocking mode), and the call's write deadline (so
//! formatting stops the moment the budget is gone, which also shrinks
//! batches near the deadline).
//!
//! Formatter failures on individual items follow the skip-and-count policy:
//! the item produces no line and the skip is reported to the caller's
//! metrics. Embedded newlines in fragments are rejected the same way; a
//! stray `\n` would desynchronize the score stream from the item order.

use crate::deadline::Deadline;
use crate::formatter::{DebugInfo, LineFormatter};

/// Result of one fill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FillOutcome {
    /// Complete lines appended to the batch buffer.
    pub(crate) lines: usize,
    /// Items skipped because the formatter failed or produced an embedded
    /// newline.
    pub(crate) skipped: usize,
}

/// Appends lines for items starting at `*cursor` onto `out`.
///
/// Stops when `max_lines` lines have been appended, when appending another
/// line would grow `out` past `max_bytes` (at least one line is always
/// accepted into an empty buffer), when the items are exhausted, or when
/// `write_deadline` expires. Advances `*cursor` past every item consumed,
/// including skipped ones.
pub(crate) fn fill_batch<F: LineFormatter>(
    formatter: &F,
    ctx: &F::Context,
    items: &[F::Item],
    cursor: &mut usize,
    common: &str,
    out: &mut Vec<u8>,
    max_lines: usize,
    max_bytes: usize,
    write_deadline: &Deadline,
    mut debug: Option<&mut DebugInfo>,
) -> FillOutcome {
    let mut outcome = FillOutcome::default();

    while *cursor < items.len() && outcome.lines < max_lines {
        if write_deadline.expired() {
            break;
        }

        let item = &items[*cursor];
        let fragment = match formatter.item(ctx, item, debug.as_deref_mut()) {
            Ok(fragment) => fragment,
            Err(_) => {
                *cursor += 1;
                outcome.skipped += 1;
                continue;
            }
        };

        let line = formatter.formatted_example(common, &fragment, None, None);
        if line.contains('\n') {
            *cursor += 1;
            outcome.skipped += 1;
            continue;
        }

        // +1 for the terminator we append below.
        if !out.is_empty() && out.len() + line.len() + 1 > max_bytes {
            break;
        }

        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        *cursor += 1;
        outcome.lines += 1;
    }

    outcome
}
