//! Frame cursors for the stack scanner.

use std::ffi::c_void;

/// A cursor over the frames of the current thread, innermost first.
///
/// The cursor starts before the innermost frame; every successful
/// [`step`](Self::step) moves it one frame outwards.
pub trait FrameCursor {
    /// Moves to the next outer frame. Returns `false` once the walk is over.
    fn step(&mut self) -> bool;

    /// Resume address of the current frame.
    fn ip(&self) -> usize;

    /// Stack pointer of the current frame at its resume address.
    fn sp(&self) -> usize;

    /// Symbol name of the function the current frame executes, if known.
    fn proc_name(&mut self) -> Option<String>;
}

#[derive(Debug, Clone, Copy)]
struct RawFrame {
    ip: usize,
    /// Canonical frame address reported by the unwinder.
    cfa: usize,
}

/// A [`FrameCursor`] over a backtrace captured with the `backtrace` crate.
///
/// The unwinder reports each frame's canonical frame address. The stack
/// pointer a frame had at its call site is the CFA of the frame it called,
/// so `sp` of frame `n` is read from frame `n - 1`.
#[derive(Debug)]
pub struct BacktraceCursor {
    frames: Vec<RawFrame>,
    position: Option<usize>,
}

impl BacktraceCursor {
    /// Captures the calling thread's stack.
    #[must_use]
    #[inline(never)]
    pub fn capture() -> Self {
        let mut frames = Vec::with_capacity(32);
        backtrace::trace(|frame| {
            frames.push(RawFrame {
                ip: frame.ip() as usize,
                cfa: frame.sp() as usize,
            });
            true
        });
        Self {
            frames,
            position: None,
        }
    }

    /// Number of captured frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn current(&self) -> Option<usize> {
        self.position.filter(|&index| index < self.frames.len())
    }
}

impl FrameCursor for BacktraceCursor {
    fn step(&mut self) -> bool {
        let next = self.position.map_or(0, |index| index + 1);
        self.position = Some(next);
        next < self.frames.len()
    }

    fn ip(&self) -> usize {
        self.current().map_or(0, |index| self.frames[index].ip)
    }

    fn sp(&self) -> usize {
        match self.current() {
            Some(0) => self.frames[0].cfa,
            Some(index) => self.frames[index - 1].cfa,
            None => 0,
        }
    }

    fn proc_name(&mut self) -> Option<String> {
        let ip = self.ip();
        if ip == 0 {
            return None;
        }
        // The resume address may already belong to the next function when the
        // call is the last instruction; resolve the call instruction instead.
        let lookup = (ip - 1) as *mut c_void;
        let mut name = None;
        backtrace::resolve(lookup, |symbol| {
            if name.is_none() {
                name = symbol
                    .name()
                    .and_then(|n| n.as_str().map(str::to_owned));
            }
        });
        name
    }
}
