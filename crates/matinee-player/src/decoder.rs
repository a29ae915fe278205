// crates/matinee-player/src/decoder.rs
//
// The generic decoder thread. Each selected stream gets one worker
// implementing `DecoderWorker`; the thread body is identical for all three
// kinds: pull a packet group from the input lane, honor the seek-mark
// barrier, feed the codec (with a retry when its queue is full), then drain
// every ready frame, re-anchoring the shared clock after a pts jump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use log::debug;

use crate::buffer::{RingBuffer, Signalable};
use crate::demux::PacketGroup;
use crate::error::Result;

/// Outcome of handing a packet to the codec.
pub(crate) enum SubmitResult {
    /// Codec took the packet (or rejected it permanently; either way the
    /// slot is released).
    Consumed,
    /// Codec queue is full; the packet goes back to the lane for a retry.
    Retry,
}

pub(crate) trait DecoderWorker: Send {
    fn submit(&mut self, packet: &ffmpeg::Packet) -> SubmitResult;

    /// Produce at most one output item; returns its pts, or `None` when the
    /// codec has nothing ready.
    fn decode_next(&mut self) -> Option<f64>;

    /// Seek barrier: drop codec state and everything queued downstream.
    fn flush(&mut self);

    /// Re-anchor the shared clock so elapsed time equals `pts` now.
    fn anchor_clock(&mut self, pts: f64);
}

const INPUT_READ_TIMEOUT: Duration = Duration::from_millis(10);

fn process_packet(
    input: &RingBuffer<PacketGroup>,
    worker: &mut dyn DecoderWorker,
    pts_jumped: &mut bool,
) {
    let Some(lease) = input.begin_read(INPUT_READ_TIMEOUT) else {
        return;
    };
    match &*lease {
        PacketGroup::SeekMark => {
            worker.flush();
            *pts_jumped = true;
            lease.finish();
        }
        PacketGroup::Data(packet) => match worker.submit(packet) {
            SubmitResult::Consumed => {
                lease.finish();
            }
            // Dropping the lease puts the packet back at the lane head.
            SubmitResult::Retry => drop(lease),
        },
    }
}

fn decode_main(
    input: &RingBuffer<PacketGroup>,
    worker: &mut dyn DecoderWorker,
    run: &AtomicBool,
) {
    let mut pts_jumped = false;
    while run.load(Ordering::Acquire) {
        process_packet(input, worker, &mut pts_jumped);
        // One packet can hold several frames; drain them all.
        while run.load(Ordering::Acquire) {
            match worker.decode_next() {
                Some(pts) => {
                    if pts_jumped {
                        worker.anchor_clock(pts);
                        pts_jumped = false;
                    }
                }
                None => break,
            }
        }
    }
    debug!("decoder thread closed");
}

/// Handle on a running decoder thread.
pub(crate) struct DecoderThread {
    run: Arc<AtomicBool>,
    input: Arc<RingBuffer<PacketGroup>>,
    output: Arc<dyn Signalable>,
    handle: Option<JoinHandle<()>>,
}

impl DecoderThread {
    pub fn spawn(
        name: &str,
        input: Arc<RingBuffer<PacketGroup>>,
        output: Arc<dyn Signalable>,
        mut worker: impl DecoderWorker + 'static,
    ) -> Result<Self> {
        let run = Arc::new(AtomicBool::new(true));
        let thread_run = Arc::clone(&run);
        let thread_input = Arc::clone(&input);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || decode_main(&thread_input, &mut worker, &thread_run))?;
        Ok(Self { run, input, output, handle: Some(handle) })
    }

    /// Ask the thread to exit; it leaves within one loop iteration. Both
    /// queues are signalled so a blocked read or write returns early.
    pub fn stop(&self) {
        self.run.store(false, Ordering::Release);
        self.input.signal();
        self.output.signal_waiters();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted worker used to exercise the thread protocol without a codec.
    struct ScriptedWorker {
        log: Arc<Mutex<Vec<String>>>,
        reject_first: bool,
        pending: usize,
    }

    impl DecoderWorker for ScriptedWorker {
        fn submit(&mut self, packet: &ffmpeg::Packet) -> SubmitResult {
            let size = packet.size();
            if self.reject_first {
                self.reject_first = false;
                self.log.lock().unwrap().push(format!("retry {size}"));
                return SubmitResult::Retry;
            }
            self.log.lock().unwrap().push(format!("submit {size}"));
            self.pending = 1;
            SubmitResult::Consumed
        }

        fn decode_next(&mut self) -> Option<f64> {
            if self.pending > 0 {
                self.pending -= 1;
                self.log.lock().unwrap().push("frame".into());
                Some(1.25)
            } else {
                None
            }
        }

        fn flush(&mut self) {
            self.pending = 0;
            self.log.lock().unwrap().push("flush".into());
        }

        fn anchor_clock(&mut self, pts: f64) {
            self.log.lock().unwrap().push(format!("anchor {pts}"));
        }
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for decoder thread");
    }

    #[test]
    fn test_seek_mark_flushes_and_anchors_next_frame() {
        let input = Arc::new(RingBuffer::new(8));
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = ScriptedWorker { log: Arc::clone(&log), reject_first: false, pending: 0 };
        let output: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(1));
        let mut thread =
            DecoderThread::spawn("test-decoder", Arc::clone(&input), output, worker).unwrap();

        input.write(PacketGroup::SeekMark).unwrap();
        input.write(PacketGroup::Data(ffmpeg::Packet::new(16))).unwrap();
        wait_for(|| log.lock().unwrap().iter().any(|l| l.starts_with("anchor")));
        thread.stop();
        thread.join();

        let log = log.lock().unwrap();
        let flush_pos = log.iter().position(|l| l == "flush").unwrap();
        let anchor_pos = log.iter().position(|l| l.starts_with("anchor")).unwrap();
        assert!(flush_pos < anchor_pos);
        assert!(log.contains(&"anchor 1.25".to_string()));
    }

    #[test]
    fn test_rejected_packet_is_retried() {
        let input = Arc::new(RingBuffer::new(4));
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = ScriptedWorker { log: Arc::clone(&log), reject_first: true, pending: 0 };
        let output: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(1));
        let mut thread =
            DecoderThread::spawn("test-decoder", Arc::clone(&input), output, worker).unwrap();

        input.write(PacketGroup::Data(ffmpeg::Packet::new(7))).unwrap();
        wait_for(|| log.lock().unwrap().iter().any(|l| l == "submit 7"));
        thread.stop();
        thread.join();

        let log = log.lock().unwrap();
        assert!(log.contains(&"retry 7".to_string()));
        assert!(log.contains(&"submit 7".to_string()));
    }
}
