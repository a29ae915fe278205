// crates/matinee-player/src/demux.rs
//
// The demuxer worker: reads container packets on its own thread and routes
// them into per-lane ring buffers for the decoder threads. Handles the seek
// protocol: on request it seeks the container, flushes every lane and
// enqueues a seek-mark so each decoder flushes its codec and re-anchors the
// clock at the first packet of the new position.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ffmpeg_the_third as ffmpeg;
use log::{debug, warn};

use crate::buffer::RingBuffer;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::source::SourceInner;

pub(crate) const VIDEO_LANE: usize = 0;
pub(crate) const AUDIO_LANE: usize = 1;
pub(crate) const SUBTITLE_LANE: usize = 2;
pub(crate) const LANE_COUNT: usize = 3;

/// Ring payload between the demuxer and a decoder. The seek-mark is the
/// barrier packet of the seek protocol.
pub(crate) enum PacketGroup {
    Data(ffmpeg::Packet),
    SeekMark,
}

enum DemuxCommand {
    Seek { target: i64, reply: Sender<bool> },
}

struct Demuxer {
    source: Arc<SourceInner>,
    lanes: [Option<Arc<RingBuffer<PacketGroup>>>; LANE_COUNT],
    stream_indexes: Arc<[AtomicI64; LANE_COUNT]>,
    finished: Arc<AtomicBool>,
}

impl Demuxer {
    /// Read and route one packet. Returns false at end of stream.
    fn step(&mut self) -> bool {
        let mut packet = ffmpeg::Packet::empty();
        {
            let mut format = self.source.format.lock().unwrap();
            match packet.read(&mut format.0) {
                Ok(()) => {}
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::ffi::EAGAIN => return true,
                Err(ffmpeg::Error::Eof) => return false,
                Err(e) => {
                    debug!("demuxer read failed: {e}");
                    return false;
                }
            }
        }

        let stream_index = packet.stream() as i64;
        for lane in 0..LANE_COUNT {
            if self.stream_indexes[lane].load(Ordering::Acquire) == stream_index {
                if let Some(buffer) = &self.lanes[lane] {
                    // May block while the lane is full; a signal (seek or
                    // shutdown) aborts the write and we drop the packet.
                    let _ = buffer.write(PacketGroup::Data(packet));
                }
                return true;
            }
        }
        // Not a selected stream; the packet drops here.
        true
    }

    fn seek(&mut self, target: i64) -> bool {
        let ok = {
            let mut format = self.source.format.lock().unwrap();
            match format.0.seek(target, ..=target) {
                Ok(()) => true,
                Err(e) => {
                    warn!("container seek failed: {e}");
                    false
                }
            }
        };
        if !ok {
            return false;
        }
        for lane in self.lanes.iter().flatten() {
            lane.flush();
            let _ = lane.write(PacketGroup::SeekMark);
        }
        self.finished.store(false, Ordering::Release);
        true
    }
}

/// Owns the demuxer thread and the packet lanes it feeds.
pub(crate) struct DemuxerThread {
    run: Arc<AtomicBool>,
    commands: Sender<DemuxCommand>,
    handle: Option<JoinHandle<()>>,
    lanes: [Option<Arc<RingBuffer<PacketGroup>>>; LANE_COUNT],
    stream_indexes: Arc<[AtomicI64; LANE_COUNT]>,
    finished: Arc<AtomicBool>,
}

impl DemuxerThread {
    pub fn spawn(
        source: Arc<SourceInner>,
        selected: [Option<usize>; LANE_COUNT],
        settings: &Settings,
    ) -> Result<Self> {
        let capacities = [
            settings.video_packet_buffer,
            settings.audio_packet_buffer,
            settings.subtitle_packet_buffer,
        ];
        let mut lanes: [Option<Arc<RingBuffer<PacketGroup>>>; LANE_COUNT] = [None, None, None];
        for lane in 0..LANE_COUNT {
            if selected[lane].is_some() {
                lanes[lane] = Some(Arc::new(RingBuffer::new(capacities[lane])));
            }
        }
        let stream_indexes: Arc<[AtomicI64; LANE_COUNT]> = Arc::new([
            AtomicI64::new(selected[VIDEO_LANE].map(|i| i as i64).unwrap_or(-1)),
            AtomicI64::new(selected[AUDIO_LANE].map(|i| i as i64).unwrap_or(-1)),
            AtomicI64::new(selected[SUBTITLE_LANE].map(|i| i as i64).unwrap_or(-1)),
        ]);

        let run = Arc::new(AtomicBool::new(true));
        let finished = Arc::new(AtomicBool::new(false));
        let (commands, receiver) = bounded::<DemuxCommand>(4);

        let mut demuxer = Demuxer {
            source,
            lanes: lanes.clone(),
            stream_indexes: Arc::clone(&stream_indexes),
            finished: Arc::clone(&finished),
        };
        let thread_run = Arc::clone(&run);
        let handle = thread::Builder::new()
            .name("matinee-demuxer".into())
            .spawn(move || demux_main(&mut demuxer, &receiver, &thread_run))?;

        Ok(Self {
            run,
            commands,
            handle: Some(handle),
            lanes,
            stream_indexes,
            finished,
        })
    }

    pub fn lane(&self, lane: usize) -> Option<Arc<RingBuffer<PacketGroup>>> {
        self.lanes[lane].clone()
    }

    pub fn lane_state(&self, lane: usize) -> Option<(usize, usize)> {
        self.lanes[lane].as_ref().map(|b| (b.len(), b.capacity()))
    }

    /// Point a lane at a different container stream (or -1 to mute it).
    /// Takes effect on the next demuxed packet.
    pub fn set_stream_index(&self, lane: usize, index: Option<usize>) {
        self.stream_indexes[lane].store(index.map(|i| i as i64).unwrap_or(-1), Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Run the seek protocol and wait for the container seek's outcome.
    pub fn seek(&self, target: i64) -> Result<()> {
        let (reply, response) = bounded(1);
        self.commands
            .send(DemuxCommand::Seek { target, reply })
            .map_err(|_| Error::PlayerClosed)?;
        // The worker may be blocked writing into a full lane; wake it.
        for lane in self.lanes.iter().flatten() {
            lane.signal();
        }
        match response.recv_timeout(Duration::from_secs(5)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Seek(ffmpeg::Error::Unknown)),
            Err(_) => Err(Error::PlayerClosed),
        }
    }

    /// Ask the thread to exit and wake it out of any blocking write.
    pub fn stop(&self) {
        self.run.store(false, Ordering::Release);
        for lane in self.lanes.iter().flatten() {
            lane.signal();
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn demux_main(demuxer: &mut Demuxer, commands: &Receiver<DemuxCommand>, run: &AtomicBool) {
    while run.load(Ordering::Acquire) {
        match commands.try_recv() {
            Ok(DemuxCommand::Seek { target, reply }) => {
                let ok = demuxer.seek(target);
                let _ = reply.send(ok);
                continue;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        if demuxer.finished.load(Ordering::Acquire) {
            // Drained the container; park briefly but stay seekable.
            match commands.recv_timeout(Duration::from_millis(10)) {
                Ok(DemuxCommand::Seek { target, reply }) => {
                    let ok = demuxer.seek(target);
                    let _ = reply.send(ok);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else if !demuxer.step() {
            demuxer.finished.store(true, Ordering::Release);
        }
    }
    debug!("demuxer thread closed");
}
