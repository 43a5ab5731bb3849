use std::collections::VecDeque;

use crate::error::Error;
use crate::frame::Frame;

/// Camera backend contract.
///
/// `Ok(None)` is a transient miss ("no frame yet"). `Err(_)` is a device
/// error. Neither stops the capture loop; see `FeedStatus`.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, Error>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    #[inline]
    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        (**self).read_frame()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedStatus {
    /// No frame received yet.
    #[default]
    Waiting,
    Live,
    /// Nothing arrived for longer than the feed timeout, or the device failed.
    Unavailable,
}

#[derive(Debug, Clone)]
pub enum Read {
    Frame(Frame),
    Miss,
    Fail(String),
}

/// In-memory source replaying a fixed list of reads.
///
/// With `looping` the script restarts from the top, otherwise every read
/// past the end is a miss. Frame sequence numbers are rewritten so they keep
/// increasing across loops.
#[derive(Debug)]
pub struct ReplaySource {
    script: Vec<Read>,
    pending: VecDeque<Read>,
    looping: bool,
    seq: u64,
}

impl ReplaySource {
    pub fn new(script: Vec<Read>, looping: bool) -> Result<Self, Error> {
        if looping && script.is_empty() {
            return Err(Error::SourceInit("looping replay needs at least one read".into()));
        }

        Ok(Self {
            pending: script.iter().cloned().collect(),
            script,
            looping,
            seq: 0,
        })
    }

    /// Endless feed of blank frames of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            script: vec![Read::Frame(Frame::blank(width, height, 0))],
            pending: VecDeque::new(),
            looping: true,
            seq: 0,
        }
    }
}

impl FrameSource for ReplaySource {
    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        if self.pending.is_empty() && self.looping {
            self.pending.extend(self.script.iter().cloned());
        }

        match self.pending.pop_front() {
            Some(Read::Frame(mut frame)) => {
                self.seq += 1;
                frame.seq = self.seq;
                Ok(Some(frame))
            }
            Some(Read::Fail(msg)) => Err(Error::SourceRead(msg)),
            Some(Read::Miss) | None => Ok(None),
        }
    }
}
