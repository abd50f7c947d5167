//! The stream manager: a state machine serializing the drive into
//! disjoint read/write phases.
//!
//! All tape access above the drive goes through here. The manager owns
//! the drive, drives the navigator, and issues single-use byte streams
//! that borrow it exclusively. Transitions outside the static table are
//! rejected; beginning a read/write phase from another read/write phase
//! first ends the running one (closing an open content set on the way).

use tracing::debug;

use crate::device::TapeIo;
use crate::drive::Drive;
use crate::error::{Result, TapeError};
use crate::navigator::{self, Navigator, SetCursor};
use crate::stream::{TapeReadStream, TapeWriteStream};
use crate::tuning::Configuration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ManagerState {
    NotInitialized,
    Open,
    MediaLoaded,
    MediaPrepared,
    ReadingToc,
    WritingToc,
    ReadingContent,
    WritingContent,
}

impl ManagerState {
    pub fn name(self) -> &'static str {
        match self {
            ManagerState::NotInitialized => "NotInitialized",
            ManagerState::Open => "Open",
            ManagerState::MediaLoaded => "MediaLoaded",
            ManagerState::MediaPrepared => "MediaPrepared",
            ManagerState::ReadingToc => "ReadingToc",
            ManagerState::WritingToc => "WritingToc",
            ManagerState::ReadingContent => "ReadingContent",
            ManagerState::WritingContent => "WritingContent",
        }
    }

    fn is_phase(self) -> bool {
        matches!(
            self,
            ManagerState::ReadingToc
                | ManagerState::WritingToc
                | ManagerState::ReadingContent
                | ManagerState::WritingContent
        )
    }
}

use ManagerState::*;

/// Every legal direct transition.
const ALLOWED_TRANSITIONS: &[(ManagerState, ManagerState)] = &[
    (NotInitialized, Open),
    (Open, MediaLoaded),
    (MediaLoaded, Open),
    (MediaLoaded, MediaPrepared),
    (MediaPrepared, MediaLoaded),
    (MediaPrepared, ReadingToc),
    (ReadingToc, MediaPrepared),
    (MediaPrepared, WritingToc),
    (WritingToc, MediaPrepared),
    (MediaPrepared, ReadingContent),
    (ReadingContent, MediaPrepared),
    (MediaPrepared, WritingContent),
    (WritingContent, MediaPrepared),
    (ReadingToc, WritingToc),
    (WritingToc, ReadingToc),
    (WritingToc, ReadingContent),
    (ReadingContent, WritingToc),
    (ReadingContent, WritingContent),
    (WritingContent, ReadingContent),
];

pub struct StreamManager {
    drive: Drive,
    navigator: Option<Box<dyn Navigator>>,
    state: ManagerState,
    config: Configuration,
    content_block_size: u32,
    filemarks_mode: bool,
    /// A content set has files in it and still needs its separator.
    set_open: bool,
    /// The last closed stream already crossed a tapemark inline.
    stream_hit_tapemark: bool,
    phase_bytes: u64,
    user_capacity_limit: Option<u64>,
}

impl StreamManager {
    /// Open a manager over an already-open endpoint.
    pub fn open_io(io: Box<dyn TapeIo>, config: Configuration) -> Result<StreamManager> {
        let drive = Drive::with_io(io, config)?;
        let mut mgr = StreamManager {
            drive,
            navigator: None,
            state: NotInitialized,
            config,
            content_block_size: config.default_block_size,
            filemarks_mode: false,
            set_open: false,
            stream_hit_tapemark: false,
            phase_bytes: 0,
            user_capacity_limit: config.user_capacity_limit,
        };
        mgr.transition(Open, "open")?;
        Ok(mgr)
    }

    /// Open a manager over the numbered OS tape device.
    pub fn open_device(device_index: u32, config: Configuration) -> Result<StreamManager> {
        let drive = Drive::open(device_index, config)?;
        let mut mgr = StreamManager {
            drive,
            navigator: None,
            state: NotInitialized,
            config,
            content_block_size: config.default_block_size,
            filemarks_mode: false,
            set_open: false,
            stream_hit_tapemark: false,
            phase_bytes: 0,
            user_capacity_limit: config.user_capacity_limit,
        };
        mgr.transition(Open, "open")?;
        Ok(mgr)
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn drive(&self) -> &Drive {
        &self.drive
    }

    pub(crate) fn drive_mut(&mut self) -> &mut Drive {
        &mut self.drive
    }

    pub fn filemarks_mode(&self) -> bool {
        self.filemarks_mode
    }

    /// Bytes moved by streams since the current phase began.
    pub fn phase_bytes(&self) -> u64 {
        self.phase_bytes
    }

    pub fn cursor(&self) -> SetCursor {
        self.navigator
            .as_ref()
            .map(|n| n.cursor())
            .unwrap_or(SetCursor::Unknown)
    }

    pub fn set_user_capacity_limit(&mut self, limit: Option<u64>) {
        self.user_capacity_limit = limit;
    }

    fn transition(&mut self, to: ManagerState, op: &'static str) -> Result<()> {
        let from = self.state;
        if !ALLOWED_TRANSITIONS.contains(&(from, to)) {
            return Err(TapeError::InvalidState {
                op,
                state: from.name(),
            });
        }
        debug!(from = from.name(), to = to.name(), "state transition");
        self.state = to;
        if to.is_phase() {
            self.phase_bytes = 0;
        }
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut dyn Navigator, &mut Drive)> {
        match self.navigator.as_deref_mut() {
            Some(nav) => Ok((nav, &mut self.drive)),
            None => Err(TapeError::InvalidState {
                op: "navigator access",
                state: self.state.name(),
            }),
        }
    }

    pub fn load_media(&mut self) -> Result<()> {
        self.transition(MediaLoaded, "load_media")?;
        self.drive.load_media()
    }

    pub fn unload_media(&mut self) -> Result<()> {
        self.transition(Open, "unload_media")?;
        self.navigator = None;
        self.drive.unload_media()
    }

    /// Build the navigator for the mounted medium and enter the
    /// prepared state. Must be redone whenever media changes.
    pub fn prepare_media(&mut self) -> Result<()> {
        self.transition(MediaPrepared, "prepare_media")?;
        self.navigator = Some(navigator::build(&self.drive, &self.config));
        self.drive.set_block_size(self.content_block_size)?;
        Ok(())
    }

    /// Drop back from prepared to loaded (e.g. before formatting).
    pub fn release_media(&mut self) -> Result<()> {
        self.transition(MediaLoaded, "release_media")?;
        self.navigator = None;
        Ok(())
    }

    /// Format the mounted medium, then rebuild the navigator if the
    /// manager was prepared.
    pub fn format_media(&mut self, initiator_size: u64) -> Result<()> {
        match self.state {
            MediaLoaded => self.drive.format_media(initiator_size),
            MediaPrepared => {
                self.drive.format_media(initiator_size)?;
                self.navigator = Some(navigator::build(&self.drive, &self.config));
                self.drive.set_block_size(self.content_block_size)?;
                Ok(())
            }
            _ => Err(TapeError::InvalidState {
                op: "format_media",
                state: self.state.name(),
            }),
        }
    }

    /// Set the block size used for content phases. Returns the clamped
    /// size actually in force.
    pub fn set_content_block_size(&mut self, size: u32) -> Result<u32> {
        let applied = self.drive.set_block_size(size)?;
        self.content_block_size = applied;
        Ok(applied)
    }

    pub fn content_block_size(&self) -> u32 {
        self.content_block_size
    }

    /// Request filemarks between files inside a set. Echoes what is
    /// actually in force; every layout can write plain filemarks, so
    /// the request always sticks.
    pub fn set_filemarks_mode(&mut self, on: bool) -> bool {
        self.filemarks_mode = on;
        self.filemarks_mode
    }

    /// End whatever read/write phase is running: close an open content
    /// set with its separator, restore the content block size, return
    /// to the prepared state.
    pub fn end_current_phase(&mut self) -> Result<()> {
        if !self.state.is_phase() {
            return Ok(());
        }
        if self.state == WritingContent && self.set_open {
            self.end_write_content_set()?;
        }
        self.transition(MediaPrepared, "end_current_phase")?;
        self.drive.set_block_size(self.content_block_size)?;
        Ok(())
    }

    fn begin_phase(&mut self, to: ManagerState, op: &'static str) -> Result<()> {
        if self.state.is_phase() {
            self.end_current_phase()?;
        }
        // Transition first so an illegal request fails before the tape
        // moves.
        self.transition(to, op)?;
        Ok(())
    }

    pub fn begin_read_toc(&mut self) -> Result<()> {
        self.begin_phase(ReadingToc, "begin_read_toc")?;
        self.drive.set_block_size(self.config.toc_block_size)?;
        let (nav, drive) = self.parts()?;
        nav.move_to_begin_of_toc(drive)
    }

    pub fn begin_write_toc(&mut self) -> Result<()> {
        self.begin_phase(WritingToc, "begin_write_toc")?;
        // Position while still at the content block size: the locator
        // gap is a content-area object.
        {
            let (nav, drive) = self.parts()?;
            nav.begin_toc_write(drive)?;
        }
        self.drive.set_block_size(self.config.toc_block_size)?;
        Ok(())
    }

    pub fn begin_read_content(&mut self) -> Result<()> {
        self.begin_phase(ReadingContent, "begin_read_content")?;
        self.drive.set_block_size(self.content_block_size)?;
        let (nav, drive) = self.parts()?;
        nav.move_to_begin_of_content(drive)
    }

    pub fn begin_write_content(&mut self) -> Result<()> {
        self.begin_phase(WritingContent, "begin_write_content")?;
        self.drive.set_block_size(self.content_block_size)?;
        let (nav, drive) = self.parts()?;
        nav.move_to_end_of_content(drive)?;
        nav.on_begin_write_content(drive)
    }

    fn require_state(&self, wanted: ManagerState, op: &'static str) -> Result<()> {
        if self.state != wanted {
            return Err(TapeError::InvalidState {
                op,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Admission check for one file of known length: it must fit into
    /// the remaining content capacity less the user's margin. Failing
    /// the check is the end-of-media signal that drives multi-volume
    /// continuation.
    pub fn begin_write_file(&mut self, length: Option<u64>) -> Result<()> {
        self.require_state(WritingContent, "begin_write_file")?;
        if let Some(length) = length {
            let user_cap = self.user_capacity_limit.unwrap_or(0);
            let remaining = {
                let (nav, drive) = self.parts()?;
                nav.remaining_content_capacity(drive)?
            };
            if length > remaining.saturating_sub(user_cap) {
                debug!(length, remaining, user_cap, "capacity guard refused file");
                return Err(TapeError::EndOfMedia);
            }
        }
        self.set_open = true;
        self.stream_hit_tapemark = false;
        Ok(())
    }

    /// Close the file being written: its trailing filemark (when files
    /// are filemark-separated) unless the stream already hit one.
    pub fn end_write_file(&mut self) -> Result<()> {
        match self.state {
            WritingToc => {
                if !self.stream_hit_tapemark {
                    self.drive.write_filemark(1)?;
                }
                Ok(())
            }
            WritingContent => {
                if self.filemarks_mode && !self.stream_hit_tapemark {
                    self.drive.write_filemark(1)?;
                }
                Ok(())
            }
            _ => Err(TapeError::InvalidState {
                op: "end_write_file",
                state: self.state.name(),
            }),
        }
    }

    /// Skip to just past the file's trailing filemark, unless the
    /// stream already crossed it inline.
    pub fn end_read_file(&mut self) -> Result<()> {
        match self.state {
            ReadingToc => {
                if !self.stream_hit_tapemark {
                    self.drive.move_next_filemark(1)?;
                }
                Ok(())
            }
            ReadingContent => {
                if self.filemarks_mode && !self.stream_hit_tapemark {
                    self.drive.move_next_filemark(1)?;
                }
                Ok(())
            }
            _ => Err(TapeError::InvalidState {
                op: "end_read_file",
                state: self.state.name(),
            }),
        }
    }

    /// Close the set being written with its separator; the cursor then
    /// sits at the end of the content area.
    pub fn end_write_content_set(&mut self) -> Result<()> {
        self.require_state(WritingContent, "end_write_content_set")?;
        let (nav, drive) = self.parts()?;
        nav.write_set_separator(drive)?;
        self.set_open = false;
        Ok(())
    }

    /// Cross one set separator while reading, advancing the cursor.
    pub fn end_read_content_set(&mut self) -> Result<()> {
        self.require_state(ReadingContent, "end_read_content_set")?;
        if self.stream_hit_tapemark && !self.filemarks_mode {
            // The separator was already crossed inline by the last
            // stream; only the cursor needs the update.
            self.stream_hit_tapemark = false;
            let (nav, _) = self.parts()?;
            if let SetCursor::At(k) = nav.cursor() {
                if k >= 0 || k < -1 {
                    nav.core_mut().cursor = SetCursor::At(k + 1);
                }
            }
            return Ok(());
        }
        let (nav, drive) = self.parts()?;
        nav.skip_set_separator(drive)
    }

    pub fn move_to_content_set(&mut self, target: i64) -> Result<()> {
        match self.state {
            ReadingContent | MediaPrepared => {
                let (nav, drive) = self.parts()?;
                nav.move_to_content_set(drive, target)
            }
            _ => Err(TapeError::InvalidState {
                op: "move_to_content_set",
                state: self.state.name(),
            }),
        }
    }

    /// Absolute-block positioning for sets whose files are not
    /// filemark-separated.
    pub fn position_at_block(&mut self, block: u64) -> Result<()> {
        self.require_state(ReadingContent, "position_at_block")?;
        self.drive.move_to_block(block)
    }

    /// Whether the active layout separates sets with plain filemarks
    /// (see [`Navigator::separators_are_filemarks`]).
    pub fn set_separators_are_filemarks(&self) -> bool {
        self.navigator
            .as_deref()
            .map(|n| n.separators_are_filemarks())
            .unwrap_or(true)
    }

    /// Catalog-derived positioning: rewind and cross a known number of
    /// filemarks. Used where separator counting cannot distinguish set
    /// and file marks. Leaves the set cursor unknown.
    pub fn position_by_filemarks(&mut self, marks: u32) -> Result<()> {
        self.require_state(ReadingContent, "position_by_filemarks")?;
        let (nav, drive) = self.parts()?;
        nav.core_mut().cursor = SetCursor::Unknown;
        drive.rewind()?;
        if marks > 0 {
            drive.move_next_filemark(marks as i32)?;
        }
        Ok(())
    }

    pub fn current_block(&mut self) -> Result<u64> {
        self.drive.current_block()
    }

    pub fn remaining_content_capacity(&mut self) -> Result<u64> {
        let (nav, drive) = self.parts()?;
        nav.remaining_content_capacity(drive)
    }

    /// Catalog agents report the outcome of a catalog read.
    pub fn notify_toc_read(&mut self, present: bool) {
        if let Some(nav) = self.navigator.as_deref_mut() {
            nav.on_toc_read(present);
        }
    }

    /// Catalog agents report that both catalog copies reached tape.
    pub fn notify_toc_written(&mut self) -> Result<()> {
        let (nav, drive) = self.parts()?;
        nav.on_toc_written(drive)
    }

    pub(crate) fn note_stream_closed(&mut self, hit_tapemark: bool, bytes: u64) {
        self.stream_hit_tapemark = hit_tapemark;
        self.phase_bytes += bytes;
    }

    pub fn produce_write_toc_stream(&mut self) -> Result<TapeWriteStream<'_>> {
        self.require_state(WritingToc, "produce_write_toc_stream")?;
        Ok(TapeWriteStream::new(self))
    }

    /// Admit a file of the given length (see [`Self::begin_write_file`])
    /// and open its write stream.
    pub fn produce_write_content_stream(
        &mut self,
        length: Option<u64>,
    ) -> Result<TapeWriteStream<'_>> {
        self.begin_write_file(length)?;
        Ok(TapeWriteStream::new(self))
    }

    pub fn produce_read_toc_stream(
        &mut self,
        textmode: bool,
        limit: Option<u64>,
    ) -> Result<TapeReadStream<'_>> {
        self.require_state(ReadingToc, "produce_read_toc_stream")?;
        self.stream_hit_tapemark = false;
        Ok(TapeReadStream::new(self, textmode, limit))
    }

    pub fn produce_read_content_stream(
        &mut self,
        textmode: bool,
        limit: Option<u64>,
    ) -> Result<TapeReadStream<'_>> {
        self.require_state(ReadingContent, "produce_read_content_stream")?;
        self.stream_hit_tapemark = false;
        Ok(TapeReadStream::new(self, textmode, limit))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::virt::{VirtualConfig, VirtualHandle, VirtualTape};
    use crate::drive::tests::test_config;
    use std::io::{Read, Write};

    pub(crate) fn prepared_manager(
        config: VirtualConfig,
    ) -> (StreamManager, VirtualHandle) {
        let (tape, handle) = VirtualTape::new(config);
        let mut mgr = StreamManager::open_io(Box::new(tape), test_config()).unwrap();
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        (mgr, handle)
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (tape, _) = VirtualTape::new(VirtualConfig::basic(1 << 20));
        let mut mgr = StreamManager::open_io(Box::new(tape), test_config()).unwrap();
        // From Open, a content write is not reachable.
        assert!(matches!(
            mgr.begin_write_content(),
            Err(TapeError::InvalidState { .. })
        ));
        // Neither is preparing before loading.
        assert!(matches!(
            mgr.prepare_media(),
            Err(TapeError::InvalidState { .. })
        ));
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        assert_eq!(mgr.state(), ManagerState::MediaPrepared);
    }

    #[test]
    fn phase_crossing_silently_ends_the_running_phase() {
        let (mut mgr, handle) = prepared_manager(VirtualConfig::with_setmarks(1 << 20));
        mgr.set_content_block_size(512).unwrap();
        mgr.begin_write_content().unwrap();

        let mut stream = mgr.produce_write_content_stream(Some(512)).unwrap();
        stream.write_all(&[7u8; 512]).unwrap();
        stream.finish().unwrap();
        mgr.end_write_file().unwrap();

        // Crossing straight into a catalog read closes the set (its
        // setmark lands on tape) and completes the transition.
        mgr.begin_read_toc().unwrap();
        assert_eq!(mgr.state(), ManagerState::ReadingToc);
        assert_eq!(mgr.cursor(), SetCursor::InToc);
        assert!(handle.layout(0).contains('S'));
    }

    #[test]
    fn content_write_then_read_round_trip() {
        let (mut mgr, _) = prepared_manager(VirtualConfig::with_setmarks(1 << 20));
        mgr.set_content_block_size(256).unwrap();

        mgr.begin_write_content().unwrap();
        let mut stream = mgr.produce_write_content_stream(Some(700)).unwrap();
        let payload: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
        stream.write_all(&payload).unwrap();
        assert_eq!(stream.finish().unwrap(), 700);
        mgr.end_write_file().unwrap();
        mgr.end_write_content_set().unwrap();
        mgr.end_current_phase().unwrap();

        mgr.begin_read_content().unwrap();
        let mut stream = mgr.produce_read_content_stream(false, Some(700)).unwrap();
        let mut back = Vec::new();
        stream.read_to_end(&mut back).unwrap();
        stream.finish().unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn capacity_guard_enforces_user_margin() {
        let (mut mgr, _) = prepared_manager(VirtualConfig::basic(1 << 20));
        mgr.set_content_block_size(256).unwrap();
        mgr.set_user_capacity_limit(Some((1 << 20) - 4096));
        mgr.begin_write_content().unwrap();

        // 4096 bytes of effective capacity: a 4096-byte file fits...
        mgr.begin_write_file(Some(4096)).unwrap();
        // ...but one byte more does not.
        assert!(matches!(
            mgr.begin_write_file(Some(4097)),
            Err(TapeError::EndOfMedia)
        ));
        // Unknown lengths are not guarded.
        mgr.begin_write_file(None).unwrap();
    }

    #[test]
    fn toc_phase_uses_its_own_block_size() {
        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 20));
        mgr.set_content_block_size(512).unwrap();

        mgr.begin_write_toc().unwrap();
        let mut stream = mgr.produce_write_toc_stream().unwrap();
        stream.write_all(&[1u8; 100]).unwrap();
        stream.finish().unwrap();
        mgr.end_write_file().unwrap();
        mgr.notify_toc_written().unwrap();
        mgr.end_current_phase().unwrap();

        // The 100-byte catalog file was padded to one catalog-sized
        // block, not one content-sized block.
        assert_eq!(
            handle.block_data(0, 0).len(),
            test_config().toc_block_size as usize
        );
        // And the content block size is back in force afterwards.
        assert_eq!(mgr.drive().block_size(), 512);
    }

    #[test]
    fn text_mode_stops_at_the_first_nul() {
        let (mut mgr, _) = prepared_manager(VirtualConfig::basic(1 << 20));
        mgr.set_content_block_size(128).unwrap();

        mgr.begin_write_content().unwrap();
        let mut payload = vec![0u8; 100];
        payload[..3].copy_from_slice(b"abc");
        for (i, byte) in payload.iter_mut().enumerate().skip(4) {
            *byte = b'x' + (i % 20) as u8;
        }
        let mut stream = mgr.produce_write_content_stream(Some(100)).unwrap();
        stream.write_all(&payload).unwrap();
        stream.finish().unwrap();
        mgr.end_write_file().unwrap();
        mgr.end_write_content_set().unwrap();

        mgr.begin_read_content().unwrap();
        let mut stream = mgr.produce_read_content_stream(true, None).unwrap();
        let mut dst = [0u8; 16];
        assert_eq!(stream.read(&mut dst).unwrap(), 3);
        assert_eq!(&dst[..3], b"abc");
        assert_eq!(stream.read(&mut dst).unwrap(), 0);
        assert!(stream.is_eof());
    }

    #[test]
    fn length_limit_clamps_and_only_rises() {
        let (mut mgr, _) = prepared_manager(VirtualConfig::basic(1 << 20));
        mgr.set_content_block_size(128).unwrap();

        mgr.begin_write_content().unwrap();
        let mut stream = mgr.produce_write_content_stream(Some(256)).unwrap();
        stream.write_all(&[9u8; 256]).unwrap();
        stream.finish().unwrap();
        mgr.end_write_file().unwrap();
        mgr.end_write_content_set().unwrap();

        mgr.begin_read_content().unwrap();
        let mut stream = mgr.produce_read_content_stream(false, Some(100)).unwrap();
        assert_eq!(stream.length(), 100);
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).unwrap();
        assert_eq!(sink.len(), 100);

        // The limit can rise but never sink below delivered bytes.
        assert!(stream.set_length_limit(50).is_err());
        stream.set_length_limit(150).unwrap();
        sink.clear();
        stream.read_to_end(&mut sink).unwrap();
        assert_eq!(sink.len(), 50);
    }
}
