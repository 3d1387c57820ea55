//! Frame pointer based stack unwinding.

/// Max unwound frames.
pub const MAX_FRAMES: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRegs {
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,
}

/// Where a function keeps the return address at current pc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameLayout {
    /// Nothing is pushed yet (function entry, `push rbp` or `ret`), return address at `[rsp]`.
    Entry,
    /// Caller frame pointer is pushed, return address at `[rsp + 8]`.
    BpPushed,
    /// Frame is set up, return address at `[rbp + 8]`.
    Established,
}

impl FrameLayout {
    /// Restore a caller frame registers.
    pub fn caller(
        self,
        frame: FrameRegs,
        read_word: &impl Fn(u64) -> Option<u64>,
    ) -> Option<FrameRegs> {
        match self {
            FrameLayout::Entry => Some(FrameRegs {
                pc: read_word(frame.sp)?,
                sp: frame.sp.checked_add(8)?,
                bp: frame.bp,
            }),
            FrameLayout::BpPushed => Some(FrameRegs {
                pc: read_word(frame.sp.checked_add(8)?)?,
                sp: frame.sp.checked_add(16)?,
                bp: read_word(frame.sp)?,
            }),
            FrameLayout::Established => {
                if frame.bp == 0 {
                    return None;
                }
                Some(FrameRegs {
                    pc: read_word(frame.bp.checked_add(8)?)?,
                    sp: frame.bp.checked_add(16)?,
                    bp: read_word(frame.bp)?,
                })
            }
        }
    }
}

/// Unwind a call stack, outer frames are expected to be established.
///
/// # Arguments
///
/// * `top`: registers of the innermost frame
/// * `layout`: frame layout at the innermost frame pc
/// * `read_word`: memory reader, `None` if memory is not accessible
pub fn unwind(
    top: FrameRegs,
    layout: FrameLayout,
    read_word: impl Fn(u64) -> Option<u64>,
) -> Vec<FrameRegs> {
    let mut frames = vec![top];
    let mut next = layout.caller(top, &read_word);

    while let Some(frame) = next {
        if frames.len() >= MAX_FRAMES || frame.pc == 0 {
            break;
        }
        let prev = frames[frames.len() - 1];
        // stack grows down, a caller frame can't be below a callee frame
        if frame.sp <= prev.sp {
            break;
        }
        frames.push(frame);
        next = FrameLayout::Established.caller(frame, &read_word);
    }
    frames
}
