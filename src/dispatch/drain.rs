//! Round-robin drain of a schedule into the stage command queues.
//!
//! Six streams (token and run configuration for each of the three stages)
//! are visited in a fixed order. A visit pushes from that stream until its
//! queue reports full or the stream is exhausted, then moves on. Nothing
//! blocks: a full queue is simply revisited on the next pass.

use crate::hw::{CommandTransport, Stage};
use crate::sched::Schedule;

/// One of the six host-to-device streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Token(Stage),
    Config(Stage),
}

impl Stream {
    /// Visit order within one drain pass.
    pub const ORDER: [Stream; 6] = [
        Stream::Token(Stage::Fetch),
        Stream::Config(Stage::Fetch),
        Stream::Token(Stage::Execute),
        Stream::Config(Stage::Execute),
        Stream::Token(Stage::Result),
        Stream::Config(Stage::Result),
    ];
}

/// Progress of one schedule through the command queues.
pub struct Drain<'a> {
    schedule: &'a Schedule,
    cursors: [usize; 6],
    passes: usize,
    pushed: usize,
}

impl<'a> Drain<'a> {
    pub fn new(schedule: &'a Schedule) -> Self {
        Self { schedule, cursors: [0; 6], passes: 0, pushed: 0 }
    }

    fn len(&self, stream: Stream) -> usize {
        match stream {
            Stream::Token(stage) => self.schedule.program(stage).tokens.len(),
            Stream::Config(stage) => self.schedule.program(stage).configs.len(),
        }
    }

    /// Entries left to push on a stream.
    pub fn remaining(&self, stream: Stream) -> usize {
        let i = Stream::ORDER.iter().position(|s| *s == stream).unwrap_or(0);
        self.len(stream) - self.cursors[i]
    }

    /// Every stream has reached the end of its sequence.
    pub fn all_pushed(&self) -> bool {
        Stream::ORDER.iter().all(|&s| self.remaining(s) == 0)
    }

    /// Drain passes made so far.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Entries pushed so far across all streams.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// One round-robin pass over all six streams. Returns entries pushed.
    pub fn fill<T: CommandTransport + ?Sized>(&mut self, transport: &mut T) -> usize {
        let before = self.pushed;
        for (i, stream) in Stream::ORDER.iter().copied().enumerate() {
            let len = self.len(stream);
            while self.cursors[i] < len {
                let n = self.cursors[i];
                match stream {
                    Stream::Token(stage) => {
                        if transport.token_queue_full(stage) {
                            break;
                        }
                        transport.push_token(stage, &self.schedule.program(stage).tokens[n]);
                    }
                    Stream::Config(stage) => {
                        if transport.config_queue_full(stage) {
                            break;
                        }
                        transport.push_config(&self.schedule.program(stage).configs[n]);
                    }
                }
                self.cursors[i] += 1;
                self.pushed += 1;
            }
        }
        self.passes += 1;
        let n = self.pushed - before;
        if n > 0 {
            log::trace!("drain pass {}: pushed {n}", self.passes);
        }
        n
    }
}
