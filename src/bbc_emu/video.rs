//! Vsync pacing stub.
//!
//! Rendering (teletext/bitmap raster) is an external collaborator.  What
//! the core owes the rest of the machine is the 50 Hz frame cadence: a
//! wheel timer that raises CA1 on the system VIA and asks the machine to
//! post a VSYNC message.  The UI supplies the framebuffer; we only track
//! the bookkeeping flags that ride along with the vsync message.

use super::timing::{Tick, TimerId, Timing};

/// 2 MHz ticks per 50 Hz frame.
pub const FRAME_TICKS: Tick = 40_000;

pub struct Video {
    timer: TimerId,
    pub frame_count: u64,
    /// Set when the guest changed CRTC framing this frame; the UI clears
    /// its buffer when it sees the flag.
    pub framing_changed: bool,
    /// The UI requested full renders (as opposed to dirty-region ones).
    pub full_render: bool,
    framebuffer: Option<*mut u32>,
}

unsafe impl Send for Video {}

impl Video {
    pub fn new(timing: &mut Timing) -> Self {
        let timer = timing.register();
        timing.start(timer, FRAME_TICKS);
        Self {
            timer,
            frame_count: 0,
            framing_changed: false,
            full_render: true,
            framebuffer: None,
        }
    }

    pub fn timer(&self) -> TimerId {
        self.timer
    }

    pub fn set_framebuffer(&mut self, buffer: *mut u32) {
        self.framebuffer = Some(buffer);
    }

    /// Wheel callback: re-arm for the next frame.  Returns the flags to
    /// carry on the VSYNC message (full render, framing changed).
    pub fn vsync_fired(&mut self, timing: &mut Timing) -> (bool, bool) {
        self.frame_count += 1;
        let overshoot = -timing.value(self.timer).min(0);
        timing.start(self.timer, (FRAME_TICKS - overshoot).max(1));
        let flags = (self.full_render, self.framing_changed);
        self.framing_changed = false;
        flags
    }
}
