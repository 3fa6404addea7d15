//! Git smart HTTP protocol implementation.
//!
//! Implements the git smart HTTP protocol for fetch and push operations.
//! See: https://git-scm.com/docs/http-protocol
//!
//! The handlers here are synchronous and own only per-request state. What
//! the client got wrong is answered in-protocol (`ERR`, `unpack`, `ng`);
//! only failures of the storage medium or the transport come back as `Err`.

use crate::negotiate::{Command, PushCapabilities, ReceiveNegotiation, ReceiveState, UploadNegotiation};
use crate::pack::{PackBuilder, PackLimits, PackParser};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter, BAND_DATA, BAND_PROGRESS};
use crate::walk::{check_connected, is_ancestor};
use crate::{GitError, Result};
use cairn_storage::{check_ref_format, ObjectId, ObjectStore, Reference, Repository, StorageError};
use std::fmt;
use std::io::{Read, Write};

/// Agent string sent with capabilities.
const AGENT: &str = concat!("agent=cairn/", env!("CARGO_PKG_VERSION"));

/// Capabilities advertised for fetch.
const UPLOAD_CAPABILITIES: &str = "side-band side-band-64k ofs-delta no-progress";

/// Capabilities advertised for push.
const RECEIVE_CAPABILITIES: &str = "report-status delete-refs ofs-delta quiet";

/// The two smart HTTP services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl Service {
    /// Returns the wire name, e.g. `git-upload-pack`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs for the transfer handlers.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Bounds for incoming packs.
    pub limits: PackLimits,
    /// Accept updates that do not fast-forward even without `+`.
    pub allow_non_fast_forwards: bool,
    /// Accept delete commands.
    pub allow_deletes: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            limits: PackLimits::default(),
            allow_non_fast_forwards: false,
            allow_deletes: true,
        }
    }
}

/// A reference advertisement line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefAdvertisement {
    /// Object ID the ref points to.
    pub id: ObjectId,
    /// Reference name.
    pub name: String,
}

/// Lists `HEAD` (when it resolves) followed by every direct ref by name.
pub fn list_advertised(repo: &Repository) -> Vec<RefAdvertisement> {
    let mut out = Vec::new();
    if let Ok(id) = repo.refs.resolve_head() {
        out.push(RefAdvertisement {
            id,
            name: "HEAD".to_string(),
        });
    }
    for (name, reference) in repo.refs.list("refs/") {
        if let Reference::Direct(id) = reference {
            out.push(RefAdvertisement { id, name });
        }
    }
    out
}

/// Advertises references for `service`.
pub fn advertise_refs<W: Write>(writer: &mut W, repo: &Repository, service: Service) -> Result<()> {
    let mut pkt_writer = PktLineWriter::new(writer);
    let refs = list_advertised(repo);

    let mut capabilities = match service {
        Service::UploadPack => UPLOAD_CAPABILITIES.to_string(),
        Service::ReceivePack => RECEIVE_CAPABILITIES.to_string(),
    };
    if service == Service::UploadPack {
        if let Some(target) = repo.refs.head_target() {
            capabilities.push_str(&format!(" symref=HEAD:{}", target));
        }
    }
    capabilities.push(' ');
    capabilities.push_str(AGENT);

    pkt_writer.write_line(&format!("# service={}", service))?;
    pkt_writer.flush_pkt()?;

    match refs.split_first() {
        Some((first, rest)) => {
            pkt_writer.write_line(&format!("{} {}\0{}", first.id, first.name, capabilities))?;
            for adv in rest {
                pkt_writer.write_line(&format!("{} {}", adv.id, adv.name))?;
            }
        }
        None => {
            pkt_writer.write_line(&format!(
                "{} capabilities^{{}}\0{}",
                ObjectId::NULL,
                capabilities
            ))?;
        }
    }

    pkt_writer.flush_pkt()?;
    pkt_writer.flush()?;

    tracing::debug!(repository = %repo.key(), %service, refs = refs.len(), "Advertised refs");
    Ok(())
}

/// Outcome of a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Number of distinct wants.
    pub wants: usize,
    /// Acknowledged common object.
    pub common: Option<ObjectId>,
    /// Objects sent in the pack.
    pub objects: usize,
    /// Message sent as `ERR` when the request was refused.
    pub error: Option<String>,
}

/// Handles git-upload-pack (fetch/clone).
pub fn upload_pack<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    repo: &Repository,
) -> Result<FetchReport> {
    let mut pkt_writer = PktLineWriter::new(writer);
    match serve_fetch(reader, &mut pkt_writer, repo) {
        Ok(report) => {
            tracing::info!(
                repository = %repo.key(),
                wants = report.wants,
                objects = report.objects,
                "Fetch served"
            );
            Ok(report)
        }
        Err(e) if !e.is_fatal() => {
            tracing::warn!(repository = %repo.key(), error = %e, "Fetch refused");
            let message = e.to_string();
            pkt_writer.write_error(&message)?;
            pkt_writer.flush()?;
            Ok(FetchReport {
                error: Some(message),
                ..Default::default()
            })
        }
        Err(e) => Err(e),
    }
}

fn serve_fetch<R: Read, W: Write>(
    reader: &mut R,
    pkt_writer: &mut PktLineWriter<W>,
    repo: &Repository,
) -> Result<FetchReport> {
    let store: &dyn ObjectStore = repo.objects.as_ref();
    let tips = list_advertised(repo).into_iter().map(|adv| adv.id);
    let mut negotiation = UploadNegotiation::new(tips);

    let mut pkt_reader = PktLineReader::new(reader);
    while !negotiation.is_done() {
        negotiation.feed(pkt_reader.read()?)?;
    }

    let common = negotiation.common(store)?;
    let ids = negotiation.objects_to_send(store)?;
    let caps = negotiation.capabilities().clone();
    tracing::debug!(
        wants = negotiation.wants().len(),
        haves = negotiation.haves().len(),
        objects = ids.len(),
        "Negotiation complete"
    );

    let mut builder = PackBuilder::new().with_deltas(caps.ofs_delta);
    for id in &ids {
        builder.add_from_store(store, id)?;
    }
    let pack = builder.build()?;

    match common {
        Some(id) => pkt_writer.write_line(&format!("ACK {}", id))?,
        None => pkt_writer.write_line("NAK")?,
    }

    match caps.side_band.max_packet_len() {
        Some(len) => {
            pkt_writer.set_sideband_len(len);
            if !caps.no_progress {
                let progress = format!("Total {} objects\n", ids.len());
                pkt_writer.write_sideband(BAND_PROGRESS, progress.as_bytes())?;
            }
            pkt_writer.write_sideband(BAND_DATA, &pack)?;
            pkt_writer.flush_pkt()?;
        }
        None => pkt_writer.inner_mut().write_all(&pack)?,
    }
    pkt_writer.flush()?;

    Ok(FetchReport {
        wants: negotiation.wants().len(),
        common,
        objects: ids.len(),
        error: None,
    })
}

/// A reference change applied by a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Repository key, `owner/name`.
    pub repository: String,
    /// Updated reference.
    pub ref_name: String,
    /// Previous value (null when created).
    pub old_id: ObjectId,
    /// New value (null when deleted).
    pub new_id: ObjectId,
}

/// Outcome of one push command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Reference the command targeted.
    pub ref_name: String,
    /// Why the command was rejected, if it was.
    pub rejection: Option<String>,
}

impl CommandStatus {
    /// Returns true if the update was applied.
    pub fn is_ok(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Pack decoding failure, if any.
    pub unpack_error: Option<String>,
    /// One entry per command, in request order.
    pub statuses: Vec<CommandStatus>,
    /// Reference changes that were applied.
    pub updates: Vec<RefUpdate>,
}

impl PushReport {
    /// Returns true if the pack unpacked and every command applied.
    pub fn is_ok(&self) -> bool {
        self.unpack_error.is_none() && self.statuses.iter().all(CommandStatus::is_ok)
    }
}

/// Handles git-receive-pack (push).
pub fn receive_pack<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    repo: &Repository,
    options: &TransferOptions,
) -> Result<PushReport> {
    let mut pkt_writer = PktLineWriter::new(writer);
    let mut session = ReceiveNegotiation::new();
    let mut pkt_reader = PktLineReader::new(reader);

    while session.state() == ReceiveState::AwaitingCommands
        || session.state() == ReceiveState::Advertising
    {
        let fed = pkt_reader.read().and_then(|pkt| session.feed(pkt));
        if let Err(e) = fed {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(repository = %repo.key(), error = %e, "Push refused");
            let message = e.to_string();
            pkt_writer.write_error(&message)?;
            pkt_writer.flush()?;
            return Ok(PushReport {
                unpack_error: Some(message),
                ..Default::default()
            });
        }
    }

    if session.state() == ReceiveState::Done {
        return Ok(PushReport::default());
    }

    let mut pack = Vec::new();
    let limit = options.limits.max_pack_bytes as u64;
    pkt_reader
        .inner_mut()
        .take(limit + 1)
        .read_to_end(&mut pack)?;

    session.advance(ReceiveState::ValidatingPack)?;
    let unpack_error = unpack(&pack, &session, repo, options)?;

    let mut report = PushReport {
        unpack_error,
        ..Default::default()
    };

    match &report.unpack_error {
        Some(_) => {
            session.advance(ReceiveState::ReportingStatus)?;
            report.statuses = session
                .commands()
                .iter()
                .map(|cmd| CommandStatus {
                    ref_name: cmd.ref_name.clone(),
                    rejection: Some("unpacker error".to_string()),
                })
                .collect();
        }
        None => {
            session.advance(ReceiveState::ApplyingRefs)?;
            for cmd in session.commands() {
                let rejection = match apply_command(repo, cmd, options)? {
                    Ok(update) => {
                        report.updates.push(update);
                        None
                    }
                    Err(reason) => {
                        tracing::warn!(
                            repository = %repo.key(),
                            ref_name = %cmd.ref_name,
                            reason,
                            "Ref update rejected"
                        );
                        Some(reason.to_string())
                    }
                };
                report.statuses.push(CommandStatus {
                    ref_name: cmd.ref_name.clone(),
                    rejection,
                });
            }
            session.advance(ReceiveState::ReportingStatus)?;
        }
    }

    if session.capabilities().report_status {
        write_report(&mut pkt_writer, &report)?;
    }
    session.advance(ReceiveState::Done)?;

    tracing::info!(
        repository = %repo.key(),
        commands = report.statuses.len(),
        updated = report.updates.len(),
        unpack_ok = report.unpack_error.is_none(),
        "Push processed"
    );
    Ok(report)
}

/// Validates the pack and writes its objects. Returns the unpack error
/// reported to the client, if any.
fn unpack(
    pack: &[u8],
    session: &ReceiveNegotiation,
    repo: &Repository,
    options: &TransferOptions,
) -> Result<Option<String>> {
    if pack.len() as u64 > options.limits.max_pack_bytes as u64 {
        return Ok(Some("pack exceeds size limit".to_string()));
    }
    if pack.is_empty() {
        if session.only_deletes() {
            return Ok(None);
        }
        return Ok(Some("missing pack data".to_string()));
    }

    let store: &dyn ObjectStore = repo.objects.as_ref();
    let decoded = PackParser::new(pack)
        .with_limits(options.limits.clone())
        .decode(store);
    let mut decoded = match decoded {
        Ok(decoded) => decoded,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!(repository = %repo.key(), error = %e, "Rejected pack");
            return Ok(Some(e.to_string()));
        }
    };

    let ids = decoded.write_to(store)?;
    tracing::debug!(repository = %repo.key(), objects = ids.len(), "Unpacked objects");
    Ok(None)
}

/// Applies one command. The inner `Err` carries the `ng` reason.
fn apply_command(
    repo: &Repository,
    cmd: &Command,
    options: &TransferOptions,
) -> Result<std::result::Result<RefUpdate, &'static str>> {
    let store: &dyn ObjectStore = repo.objects.as_ref();

    if check_ref_format(&cmd.ref_name).is_err() {
        return Ok(Err("invalid ref name"));
    }
    if cmd.is_delete() {
        if !options.allow_deletes {
            return Ok(Err("deletion prohibited"));
        }
    } else if !store.contains(&cmd.new_id)? {
        return Ok(Err("missing object"));
    }

    if repo.refs.read(&cmd.ref_name) != cmd.expected() {
        return Ok(Err("RefConflict"));
    }

    if !cmd.is_delete() {
        let tips: Vec<ObjectId> = repo
            .refs
            .list("refs/")
            .into_iter()
            .filter_map(|(_, reference)| reference.as_direct())
            .collect();
        match check_connected(store, &cmd.new_id, &tips) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(ref_name = %cmd.ref_name, error = %e, "Push is not connected");
                return Ok(Err("missing object"));
            }
        }
    }

    if let (Some(old), false) = (cmd.expected(), cmd.is_delete()) {
        if !options.allow_non_fast_forwards && !cmd.force {
            match is_ancestor(store, &old, &cmd.new_id) {
                Ok(true) => {}
                Ok(false) => return Ok(Err("non-fast-forward")),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => return Ok(Err("missing object")),
            }
        }
    }

    match repo
        .refs
        .compare_and_swap(&cmd.ref_name, cmd.expected(), cmd.target())
    {
        Ok(()) => Ok(Ok(RefUpdate {
            repository: repo.key(),
            ref_name: cmd.ref_name.clone(),
            old_id: cmd.old_id,
            new_id: cmd.new_id,
        })),
        Err(StorageError::RefConflict { .. }) => Ok(Err("RefConflict")),
        Err(StorageError::InvalidRef(_)) => Ok(Err("invalid ref name")),
        Err(e) => Err(GitError::from(e)),
    }
}

fn write_report<W: Write>(pkt_writer: &mut PktLineWriter<W>, report: &PushReport) -> Result<()> {
    match &report.unpack_error {
        None => pkt_writer.write_line("unpack ok")?,
        Some(err) => pkt_writer.write_line(&format!("unpack {}", err.replace('\n', " ")))?,
    }
    for status in &report.statuses {
        match &status.rejection {
            None => pkt_writer.write_line(&format!("ok {}", status.ref_name))?,
            Some(reason) => {
                pkt_writer.write_line(&format!("ng {} {}", status.ref_name, reason))?
            }
        }
    }
    pkt_writer.flush_pkt()?;
    pkt_writer.flush()?;
    Ok(())
}

/// Reads a status report as written by [`receive_pack`].
///
/// Used by clients and tests to interpret a push response.
pub fn parse_report<R: Read>(reader: &mut R) -> Result<PushReport> {
    let mut pkt_reader = PktLineReader::new(reader);
    let mut report = PushReport::default();

    let first = pkt_reader
        .read()?
        .ok_or_else(|| GitError::ProtocolViolation("empty status report".to_string()))?;
    let line = first.as_str().unwrap_or_default().to_string();
    if let Some(msg) = line.strip_prefix("ERR ") {
        report.unpack_error = Some(msg.to_string());
        return Ok(report);
    }
    match line.strip_prefix("unpack ") {
        Some("ok") => {}
        Some(err) => report.unpack_error = Some(err.to_string()),
        None => {
            return Err(GitError::ProtocolViolation(format!(
                "expected unpack status, got {:?}",
                line
            )))
        }
    }

    for pkt in pkt_reader.read_until_flush()? {
        let line = pkt.as_str().unwrap_or_default();
        if let Some(name) = line.strip_prefix("ok ") {
            report.statuses.push(CommandStatus {
                ref_name: name.to_string(),
                rejection: None,
            });
        } else if let Some(rest) = line.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            report.statuses.push(CommandStatus {
                ref_name: name.to_string(),
                rejection: Some(reason.to_string()),
            });
        }
    }
    Ok(report)
}

/// Writes a push request: commands, flush, then the pack.
pub fn write_push_request<W: Write>(
    writer: &mut W,
    commands: &[Command],
    capabilities: &PushCapabilities,
    pack: Option<&[u8]>,
) -> Result<()> {
    let mut caps = Vec::new();
    if capabilities.report_status {
        caps.push("report-status");
    }
    if capabilities.delete_refs {
        caps.push("delete-refs");
    }
    if capabilities.ofs_delta {
        caps.push("ofs-delta");
    }
    if capabilities.quiet {
        caps.push("quiet");
    }

    let mut pkt_writer = PktLineWriter::new(&mut *writer);
    for (i, cmd) in commands.iter().enumerate() {
        let name = if cmd.force {
            format!("+{}", cmd.ref_name)
        } else {
            cmd.ref_name.clone()
        };
        let mut line = format!("{} {} {}", cmd.old_id, cmd.new_id, name);
        if i == 0 {
            line.push('\0');
            line.push_str(&caps.join(" "));
        }
        pkt_writer.write(&PktLine::from_string(&format!("{}\n", line)))?;
    }
    pkt_writer.flush_pkt()?;
    if let Some(pack) = pack {
        writer.write_all(pack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_storage::{GitObject, MemoryStore};
    use std::io::Cursor;
    use std::sync::Arc;

    const SIG: &str = "Alice <alice@example.com> 1700000000 +0000";

    fn repo() -> Repository {
        Repository::new("alice", "demo", Arc::new(MemoryStore::new()))
    }

    /// Builds a one-file commit, returning it and all three objects.
    fn commit(content: &str, parents: &[ObjectId]) -> (ObjectId, Vec<GitObject>) {
        let blob = GitObject::blob(content.as_bytes().to_vec());
        let tree = GitObject::tree(&[("100644", "README", blob.id)]);
        let commit = GitObject::commit(&tree.id, parents, SIG, SIG, "msg\n");
        (commit.id, vec![commit, tree, blob])
    }

    fn pack_of(objects: &[GitObject]) -> Vec<u8> {
        let mut builder = PackBuilder::new();
        for obj in objects {
            builder.add(obj.clone());
        }
        builder.build().unwrap()
    }

    fn caps() -> PushCapabilities {
        PushCapabilities {
            report_status: true,
            ..Default::default()
        }
    }

    fn cmd(old: ObjectId, new: ObjectId, name: &str) -> Command {
        Command {
            old_id: old,
            new_id: new,
            ref_name: name.to_string(),
            force: false,
        }
    }

    fn push(
        repo: &Repository,
        commands: &[Command],
        pack: Option<&[u8]>,
        options: &TransferOptions,
    ) -> (PushReport, PushReport) {
        let mut request = Vec::new();
        write_push_request(&mut request, commands, &caps(), pack).unwrap();
        let mut response = Vec::new();
        let report = receive_pack(&mut Cursor::new(request), &mut response, repo, options).unwrap();
        let parsed = parse_report(&mut Cursor::new(response)).unwrap();
        (report, parsed)
    }

    #[test]
    fn test_advertise_empty_repo() {
        let repo = repo();
        let mut output = Vec::new();
        advertise_refs(&mut output, &repo, Service::ReceivePack).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(output));
        assert_eq!(
            reader.read().unwrap().unwrap().as_str(),
            Some("# service=git-receive-pack")
        );
        assert_eq!(reader.read().unwrap(), Some(PktLine::Flush));
        let line = reader.read().unwrap().unwrap();
        let text = line.as_str().unwrap();
        assert!(text.starts_with(&format!("{} capabilities^{{}}\0", ObjectId::NULL)));
        assert!(text.contains("report-status"));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Flush));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn test_advertise_refs_sorted_with_symref() {
        let repo = repo();
        let (c1, objects) = commit("one", &[]);
        repo.objects.put_batch(objects).unwrap();
        for name in ["refs/tags/v1", "refs/heads/main", "refs/heads/dev"] {
            repo.refs.compare_and_swap(name, None, Some(c1)).unwrap();
        }

        let mut output = Vec::new();
        advertise_refs(&mut output, &repo, Service::UploadPack).unwrap();
        let mut reader = PktLineReader::new(Cursor::new(output));
        reader.read_until_flush().unwrap();
        let lines: Vec<String> = reader
            .read_until_flush()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap().to_string())
            .collect();

        assert!(lines[0].starts_with(&format!("{} HEAD\0", c1)));
        assert!(lines[0].contains("symref=HEAD:refs/heads/main"));
        assert!(lines[0].contains("side-band-64k"));
        let names: Vec<_> = lines[1..]
            .iter()
            .map(|l| l.split(' ').nth(1).unwrap())
            .collect();
        assert_eq!(names, vec!["refs/heads/dev", "refs/heads/main", "refs/tags/v1"]);
    }

    #[test]
    fn test_upload_empty_negotiation_yields_empty_pack() {
        let repo = repo();
        let mut request = Vec::new();
        PktLineWriter::new(&mut request).flush_pkt().unwrap();

        let mut response = Vec::new();
        let report = upload_pack(&mut Cursor::new(request), &mut response, &repo).unwrap();
        assert_eq!(report.objects, 0);

        let mut cursor = Cursor::new(response);
        let mut reader = PktLineReader::new(&mut cursor);
        assert_eq!(reader.read().unwrap().unwrap().as_str(), Some("NAK"));
        let mut pack = Vec::new();
        cursor.read_to_end(&mut pack).unwrap();
        assert_eq!(pack.len(), 32);
        let store = MemoryStore::new();
        assert!(PackParser::new(&pack).decode(&store).unwrap().is_empty());
    }

    #[test]
    fn test_upload_not_our_ref() {
        let repo = repo();
        let mut request = Vec::new();
        {
            let mut w = PktLineWriter::new(&mut request);
            w.write_line(&format!("want {}", ObjectId::from_bytes([5; 20])))
                .unwrap();
            w.flush_pkt().unwrap();
            w.write_line("done").unwrap();
        }
        let mut response = Vec::new();
        let report = upload_pack(&mut Cursor::new(request), &mut response, &repo).unwrap();
        assert!(report.error.unwrap().contains("not our ref"));
        assert!(String::from_utf8_lossy(&response).contains("ERR "));
    }

    #[test]
    fn test_upload_sideband_fetch_with_ack() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let (c2, second) = commit("two", &[c1]);
        repo.objects.put_batch(first).unwrap();
        repo.objects.put_batch(second).unwrap();
        repo.refs
            .compare_and_swap("refs/heads/main", None, Some(c2))
            .unwrap();

        let mut request = Vec::new();
        {
            let mut w = PktLineWriter::new(&mut request);
            w.write_line(&format!("want {} side-band-64k ofs-delta", c2)).unwrap();
            w.flush_pkt().unwrap();
            w.write_line(&format!("have {}", c1)).unwrap();
            w.write_line("done").unwrap();
        }
        let mut response = Vec::new();
        let report = upload_pack(&mut Cursor::new(request), &mut response, &repo).unwrap();
        assert_eq!(report.common, Some(c1));
        assert_eq!(report.objects, 3);

        let mut reader = PktLineReader::new(Cursor::new(response));
        assert_eq!(
            reader.read().unwrap().unwrap().as_str(),
            Some(format!("ACK {}", c1).as_str())
        );
        let mut pack = Vec::new();
        for pkt in reader.read_until_flush().unwrap() {
            let data = pkt.data().unwrap();
            if data[0] == BAND_DATA {
                pack.extend_from_slice(&data[1..]);
            }
        }
        let decoded = PackParser::new(&pack).decode(&MemoryStore::new()).unwrap();
        assert!(decoded.contains(&c2));
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn test_push_create_and_update() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let (report, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c1, "refs/heads/main")],
            Some(&pack_of(&first)),
            &TransferOptions::default(),
        );
        assert!(report.is_ok());
        assert_eq!(parsed, PushReport { updates: vec![], ..report.clone() });
        assert_eq!(report.updates[0].repository, "alice/demo");
        assert_eq!(repo.head().unwrap(), c1);

        let (c2, second) = commit("two", &[c1]);
        let (report, _) = push(
            &repo,
            &[cmd(c1, c2, "refs/heads/main")],
            Some(&pack_of(&second)),
            &TransferOptions::default(),
        );
        assert!(report.is_ok());
        assert_eq!(repo.head().unwrap(), c2);
    }

    #[test]
    fn test_push_stale_old_is_ref_conflict() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let (c2, second) = commit("two", &[]);
        repo.objects.put_batch(first).unwrap();
        repo.refs
            .compare_and_swap("refs/heads/main", None, Some(c1))
            .unwrap();

        let (_, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c2, "refs/heads/main")],
            Some(&pack_of(&second)),
            &TransferOptions::default(),
        );
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("RefConflict"));
        assert_eq!(repo.head().unwrap(), c1);
    }

    #[test]
    fn test_push_missing_object() {
        let repo = repo();
        let (c1, _) = commit("one", &[]);
        let empty = PackBuilder::new().build().unwrap();
        let (_, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c1, "refs/heads/main")],
            Some(&empty),
            &TransferOptions::default(),
        );
        assert!(parsed.unpack_error.is_none());
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("missing object"));
    }

    #[test]
    fn test_push_non_fast_forward_rejected_by_default() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let (c2, second) = commit("unrelated", &[]);
        repo.objects.put_batch(first).unwrap();
        repo.refs
            .compare_and_swap("refs/heads/main", None, Some(c1))
            .unwrap();

        let (report, parsed) = push(
            &repo,
            &[cmd(c1, c2, "refs/heads/main")],
            Some(&pack_of(&second)),
            &TransferOptions::default(),
        );
        assert!(report.updates.is_empty());
        assert_eq!(parsed.statuses[0].ref_name, "refs/heads/main");
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("non-fast-forward"));
        assert_eq!(repo.head().unwrap(), c1);

        let mut forced = cmd(c1, c2, "refs/heads/main");
        forced.force = true;
        let (report, _) = push(&repo, &[forced], Some(&pack_of(&[])), &TransferOptions::default());
        assert!(report.is_ok());
        assert_eq!(repo.head().unwrap(), c2);
    }

    #[test]
    fn test_push_non_fast_forward_allowed_by_option() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let (c2, second) = commit("unrelated", &[]);
        repo.objects.put_batch(first).unwrap();
        repo.refs
            .compare_and_swap("refs/heads/main", None, Some(c1))
            .unwrap();

        let options = TransferOptions {
            allow_non_fast_forwards: true,
            ..Default::default()
        };
        let (report, _) = push(
            &repo,
            &[cmd(c1, c2, "refs/heads/main")],
            Some(&pack_of(&second)),
            &options,
        );
        assert!(report.is_ok());
        assert_eq!(repo.head().unwrap(), c2);
    }

    #[test]
    fn test_push_commit_without_tree_rejected() {
        let repo = repo();
        let (c1, objects) = commit("one", &[]);
        let (_, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c1, "refs/heads/main")],
            Some(&pack_of(&objects[..1])),
            &TransferOptions::default(),
        );
        assert!(parsed.unpack_error.is_none());
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("missing object"));
        assert!(repo.refs.read("refs/heads/main").is_none());
    }

    #[test]
    fn test_push_on_top_of_existing_history() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        repo.objects.put_batch(first.clone()).unwrap();
        repo.refs
            .compare_and_swap("refs/heads/main", None, Some(c1))
            .unwrap();

        // Only the new commit travels; its tree and parent are already here.
        let c2 = GitObject::commit(&first[1].id, &[c1], SIG, SIG, "again\n");
        let (report, _) = push(
            &repo,
            &[cmd(c1, c2.id, "refs/heads/main")],
            Some(&pack_of(&[c2.clone()])),
            &TransferOptions::default(),
        );
        assert!(report.is_ok());
        assert_eq!(repo.head().unwrap(), c2.id);
    }

    #[test]
    fn test_push_delete() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        repo.objects.put_batch(first).unwrap();
        repo.refs
            .compare_and_swap("refs/heads/old", None, Some(c1))
            .unwrap();

        let denied = TransferOptions {
            allow_deletes: false,
            ..Default::default()
        };
        let delete = [cmd(c1, ObjectId::NULL, "refs/heads/old")];
        let (_, parsed) = push(&repo, &delete, None, &denied);
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("deletion prohibited"));

        let (report, _) = push(&repo, &delete, None, &TransferOptions::default());
        assert!(report.is_ok());
        assert_eq!(report.updates[0].new_id, ObjectId::NULL);
        assert!(repo.refs.read("refs/heads/old").is_none());
    }

    #[test]
    fn test_push_invalid_ref_name() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let (_, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c1, "refs/heads/../evil")],
            Some(&pack_of(&first)),
            &TransferOptions::default(),
        );
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("invalid ref name"));
    }

    #[test]
    fn test_push_corrupt_pack_changes_nothing() {
        let repo = repo();
        let (c1, first) = commit("one", &[]);
        let mut pack = pack_of(&first);
        let mid = pack.len() / 2;
        pack[mid] ^= 0x40;

        let (report, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c1, "refs/heads/main")],
            Some(&pack),
            &TransferOptions::default(),
        );
        assert!(!report.is_ok());
        assert!(parsed.unpack_error.is_some());
        assert_eq!(parsed.statuses[0].rejection.as_deref(), Some("unpacker error"));
        assert!(repo.objects.is_empty().unwrap());
        assert!(repo.refs.read("refs/heads/main").is_none());
    }

    #[test]
    fn test_push_missing_pack() {
        let repo = repo();
        let (c1, _) = commit("one", &[]);
        let (_, parsed) = push(
            &repo,
            &[cmd(ObjectId::NULL, c1, "refs/heads/main")],
            None,
            &TransferOptions::default(),
        );
        assert_eq!(parsed.unpack_error.as_deref(), Some("missing pack data"));
    }

    #[test]
    fn test_push_malformed_command() {
        let repo = repo();
        let mut request = Vec::new();
        {
            let mut w = PktLineWriter::new(&mut request);
            w.write_line("not a command").unwrap();
            w.flush_pkt().unwrap();
        }
        let mut response = Vec::new();
        let report =
            receive_pack(&mut Cursor::new(request), &mut response, &repo, &TransferOptions::default())
                .unwrap();
        assert!(report.unpack_error.is_some());
        assert!(response.starts_with(b"00"));
        assert!(String::from_utf8_lossy(&response).contains("ERR protocol violation"));
    }

    #[test]
    fn test_push_empty_request() {
        let repo = repo();
        let mut request = Vec::new();
        PktLineWriter::new(&mut request).flush_pkt().unwrap();
        let mut response = Vec::new();
        let report =
            receive_pack(&mut Cursor::new(request), &mut response, &repo, &TransferOptions::default())
                .unwrap();
        assert!(report.statuses.is_empty());
        assert!(response.is_empty());
    }

    #[test]
    fn test_service_names() {
        assert_eq!(Service::parse("git-upload-pack"), Some(Service::UploadPack));
        assert_eq!(Service::parse("git-receive-pack"), Some(Service::ReceivePack));
        assert_eq!(Service::parse("git-archive"), None);
        assert_eq!(Service::ReceivePack.to_string(), "git-receive-pack");
    }
}
