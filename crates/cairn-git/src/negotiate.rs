//! Fetch and push negotiation state machines.
//!
//! Both sides are fed one pkt-line at a time (`None` marks end of input)
//! and move through explicit states. Neither performs I/O; the transfer
//! handlers in [`crate::protocol`] own reading, writing and storage.

use crate::pktline::{PktLine, MAX_PKT_LEN, SIDEBAND_PKT_LEN};
use crate::walk::missing_closure;
use crate::{GitError, Result};
use cairn_storage::{ObjectId, ObjectStore};
use std::collections::HashSet;

fn violation(msg: impl Into<String>) -> GitError {
    GitError::ProtocolViolation(msg.into())
}

fn line_of(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data)
        .map(|s| s.trim_end_matches('\n'))
        .map_err(|_| violation("non-utf8 command line"))
}

fn parse_id(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).map_err(|_| violation(format!("malformed object id {:?}", hex)))
}

/// Side-band framing requested by a fetching client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideBand {
    /// Pack bytes are sent raw.
    #[default]
    None,
    /// `side-band`: packets of at most 1000 bytes.
    Basic,
    /// `side-band-64k`: packets of at most 65520 bytes.
    Large,
}

impl SideBand {
    /// Largest packet length allowed on this channel.
    pub fn max_packet_len(self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Basic => Some(SIDEBAND_PKT_LEN),
            Self::Large => Some(MAX_PKT_LEN),
        }
    }
}

/// Capabilities a fetching client asked for on its first `want` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchCapabilities {
    /// Side-band framing.
    pub side_band: SideBand,
    /// Client accepts ofs-delta entries.
    pub ofs_delta: bool,
    /// Client does not want progress messages.
    pub no_progress: bool,
    /// Client agent string.
    pub agent: Option<String>,
}

impl FetchCapabilities {
    fn parse<'a>(words: impl Iterator<Item = &'a str>) -> Self {
        let mut caps = Self::default();
        for word in words {
            match word {
                "side-band-64k" => caps.side_band = SideBand::Large,
                "side-band" if caps.side_band == SideBand::None => caps.side_band = SideBand::Basic,
                "ofs-delta" => caps.ofs_delta = true,
                "no-progress" => caps.no_progress = true,
                other => {
                    if let Some(agent) = other.strip_prefix("agent=") {
                        caps.agent = Some(agent.to_string());
                    }
                }
            }
        }
        caps
    }
}

/// Server side of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// References advertised, nothing received yet.
    Advertising,
    /// Receiving `want`/`have` lines.
    Negotiating,
    /// Negotiation finished; the pack can be computed.
    Done,
}

/// Incremental parser for a client's fetch request.
#[derive(Debug)]
pub struct UploadNegotiation {
    state: UploadState,
    advertised: HashSet<ObjectId>,
    wants: Vec<ObjectId>,
    haves: Vec<ObjectId>,
    wants_closed: bool,
    capabilities: FetchCapabilities,
}

impl UploadNegotiation {
    /// Starts a negotiation in which only `advertised` tips may be wanted.
    pub fn new(advertised: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            state: UploadState::Advertising,
            advertised: advertised.into_iter().collect(),
            wants: Vec::new(),
            haves: Vec::new(),
            wants_closed: false,
            capabilities: FetchCapabilities::default(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Returns true once negotiation has finished.
    pub fn is_done(&self) -> bool {
        self.state == UploadState::Done
    }

    /// Requested tips.
    pub fn wants(&self) -> &[ObjectId] {
        &self.wants
    }

    /// Objects the client claims to have.
    pub fn haves(&self) -> &[ObjectId] {
        &self.haves
    }

    /// Capabilities from the first `want` line.
    pub fn capabilities(&self) -> &FetchCapabilities {
        &self.capabilities
    }

    /// Feeds the next packet, or `None` at end of input.
    pub fn feed(&mut self, pkt: Option<PktLine>) -> Result<()> {
        match self.state {
            UploadState::Done => return Err(violation("data after done")),
            UploadState::Advertising => self.state = UploadState::Negotiating,
            UploadState::Negotiating => {}
        }

        let data = match pkt {
            None => {
                self.state = UploadState::Done;
                return Ok(());
            }
            Some(PktLine::Flush) => {
                self.wants_closed = true;
                return Ok(());
            }
            Some(PktLine::Data(data)) => data,
            Some(other) => return Err(violation(format!("unexpected {:?}", other))),
        };

        let line = line_of(&data)?;
        let mut words = line.split(' ');
        match words.next().unwrap_or_default() {
            "want" => {
                if self.wants_closed || !self.haves.is_empty() {
                    return Err(violation("want after have"));
                }
                let id = parse_id(words.next().unwrap_or_default())?;
                if !self.advertised.contains(&id) {
                    return Err(violation(format!("not our ref {}", id)));
                }
                if self.wants.is_empty() {
                    self.capabilities = FetchCapabilities::parse(words);
                }
                if !self.wants.contains(&id) {
                    self.wants.push(id);
                }
            }
            "have" => {
                self.wants_closed = true;
                self.haves.push(parse_id(words.next().unwrap_or_default())?);
            }
            "done" => self.state = UploadState::Done,
            "shallow" | "deepen" | "deepen-since" | "deepen-not" | "filter" => {
                return Err(violation(format!("{} is not supported", line)));
            }
            _ => return Err(violation(format!("unexpected line {:?}", line))),
        }
        Ok(())
    }

    /// The last `have` the store knows, acknowledged as common ground.
    pub fn common(&self, store: &dyn ObjectStore) -> Result<Option<ObjectId>> {
        for id in self.haves.iter().rev() {
            if store.contains(id)? {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    /// Objects the client needs: reachable from wants, not from haves.
    pub fn objects_to_send(&self, store: &dyn ObjectStore) -> Result<Vec<ObjectId>> {
        missing_closure(store, &self.wants, &self.haves)
    }
}

/// Server side of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// References advertised, nothing received yet.
    Advertising,
    /// Reading update commands.
    AwaitingCommands,
    /// Reading the pack that follows the commands.
    ReceivingPack,
    /// Decoding and verifying the pack.
    ValidatingPack,
    /// Applying reference updates.
    ApplyingRefs,
    /// Writing the status report.
    ReportingStatus,
    /// Finished.
    Done,
}

impl ReceiveState {
    fn can_advance_to(self, next: Self) -> bool {
        use ReceiveState::*;
        matches!(
            (self, next),
            (Advertising, AwaitingCommands)
                | (AwaitingCommands, ReceivingPack)
                | (AwaitingCommands, Done)
                | (ReceivingPack, ValidatingPack)
                | (ValidatingPack, ApplyingRefs)
                | (ValidatingPack, ReportingStatus)
                | (ApplyingRefs, ReportingStatus)
                | (ReportingStatus, Done)
        )
    }
}

/// Capabilities a pushing client asked for on its first command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushCapabilities {
    /// Client wants a status report.
    pub report_status: bool,
    /// Client may send delete commands.
    pub delete_refs: bool,
    /// Client may send ofs-delta entries.
    pub ofs_delta: bool,
    /// Client wants no progress output.
    pub quiet: bool,
    /// Client agent string.
    pub agent: Option<String>,
}

impl PushCapabilities {
    fn parse(list: &str) -> Self {
        let mut caps = Self::default();
        for word in list.split(' ') {
            match word {
                "report-status" => caps.report_status = true,
                "delete-refs" => caps.delete_refs = true,
                "ofs-delta" => caps.ofs_delta = true,
                "quiet" => caps.quiet = true,
                other => {
                    if let Some(agent) = other.strip_prefix("agent=") {
                        caps.agent = Some(agent.to_string());
                    }
                }
            }
        }
        caps
    }
}

/// A reference update requested by a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Value the client believes the reference has (null = absent).
    pub old_id: ObjectId,
    /// Value to set (null = delete).
    pub new_id: ObjectId,
    /// Reference name.
    pub ref_name: String,
    /// Update regardless of fast-forward rules.
    pub force: bool,
}

impl Command {
    /// Parses `<old> <new> <ref>`, where a leading `+` on the ref forces.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(violation(format!("malformed command {:?}", line)));
        };
        let (ref_name, force) = match name.strip_prefix('+') {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        if ref_name.is_empty() {
            return Err(violation("command without reference name"));
        }
        Ok(Self {
            old_id: parse_id(old)?,
            new_id: parse_id(new)?,
            ref_name: ref_name.to_string(),
            force,
        })
    }

    /// Returns true if the reference is created.
    pub fn is_create(&self) -> bool {
        self.old_id.is_null() && !self.new_id.is_null()
    }

    /// Returns true if the reference is deleted.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_null()
    }

    /// Expected current value for compare-and-swap.
    pub fn expected(&self) -> Option<ObjectId> {
        (!self.old_id.is_null()).then_some(self.old_id)
    }

    /// Value to store, `None` for delete.
    pub fn target(&self) -> Option<ObjectId> {
        (!self.new_id.is_null()).then_some(self.new_id)
    }
}

/// Incremental parser and state tracker for a push.
#[derive(Debug)]
pub struct ReceiveNegotiation {
    state: ReceiveState,
    commands: Vec<Command>,
    capabilities: PushCapabilities,
}

impl Default for ReceiveNegotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveNegotiation {
    /// Starts a push after the references were advertised.
    pub fn new() -> Self {
        Self {
            state: ReceiveState::Advertising,
            commands: Vec::new(),
            capabilities: PushCapabilities::default(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Commands received so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Capabilities from the first command.
    pub fn capabilities(&self) -> &PushCapabilities {
        &self.capabilities
    }

    /// Moves to `next`, rejecting transitions the protocol does not allow.
    pub fn advance(&mut self, next: ReceiveState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(violation(format!(
                "invalid push transition {:?} -> {:?}",
                self.state, next
            )));
        }
        tracing::trace!(from = ?self.state, to = ?next, "Push state");
        self.state = next;
        Ok(())
    }

    /// Feeds the next command packet, or `None` at end of input.
    pub fn feed(&mut self, pkt: Option<PktLine>) -> Result<()> {
        if self.state == ReceiveState::Advertising {
            self.advance(ReceiveState::AwaitingCommands)?;
        }
        if self.state != ReceiveState::AwaitingCommands {
            return Err(violation("command after command list ended"));
        }

        match pkt {
            None if self.commands.is_empty() => self.advance(ReceiveState::Done),
            None => Err(violation("unexpected end of input in command list")),
            Some(PktLine::Flush) if self.commands.is_empty() => self.advance(ReceiveState::Done),
            Some(PktLine::Flush) => self.advance(ReceiveState::ReceivingPack),
            Some(PktLine::Data(data)) => {
                let line = line_of(&data)?;
                let command_part = match line.split_once('\0') {
                    Some((command, caps)) if self.commands.is_empty() => {
                        self.capabilities = PushCapabilities::parse(caps);
                        command
                    }
                    Some(_) => return Err(violation("capabilities after first command")),
                    None => line,
                };
                self.commands.push(Command::parse(command_part)?);
                Ok(())
            }
            Some(other) => Err(violation(format!("unexpected {:?}", other))),
        }
    }

    /// Returns true if every command deletes a reference.
    pub fn only_deletes(&self) -> bool {
        self.commands.iter().all(Command::is_delete)
    }
}
