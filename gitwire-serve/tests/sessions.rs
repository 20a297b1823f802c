//! Full server sessions driven by scripted client bytes over in-memory
//! streams.

use bstr::{BString, ByteSlice};
use gitwire_hash::ObjectId;
use gitwire_pack::store::MemoryStore;
use gitwire_protocol::push::CommandUpdate;
use gitwire_protocol::{History, Ref};
use gitwire_pktline::encode;
use gitwire_serve::receive::{ReceiveOptions, ReceiveSession, RefTransaction};
use gitwire_serve::upload::{PackRequest, PackSource, UploadOptions, UploadSession};
use gitwire_serve::{CancellationFlag, Error, Kind, PolicySet, RefSource};
use std::collections::HashMap;
use std::io::Write as _;

fn oid(byte: u8) -> ObjectId {
    ObjectId::from_bytes_or_panic(&[byte; 20])
}

/// A repository view with refs main -> C2 and history C1 <- C2.
struct Repo {
    refs: Vec<Ref>,
    parents: HashMap<ObjectId, Vec<ObjectId>>,
}

impl Repo {
    fn new(main: ObjectId) -> Self {
        let mut parents = HashMap::new();
        parents.insert(oid(1), vec![]);
        parents.insert(oid(2), vec![oid(1)]);
        Self {
            refs: vec![Ref::Direct {
                full_ref_name: "refs/heads/main".into(),
                object: main,
            }],
            parents,
        }
    }
}

impl RefSource for Repo {
    fn advertised_refs(&self) -> Vec<Ref> {
        self.refs.clone()
    }
}

impl History for Repo {
    fn local_tips(&self) -> Vec<ObjectId> {
        self.refs.iter().filter_map(Ref::target_id).collect()
    }
    fn parents(&self, id: &ObjectId) -> Option<Vec<ObjectId>> {
        self.parents.get(id).cloned()
    }
    fn contains(&self, id: &ObjectId) -> bool {
        self.parents.contains_key(id)
    }
}

struct StubPack;

impl PackSource for StubPack {
    fn write_pack(
        &mut self,
        _request: &PackRequest<'_>,
        out: &mut dyn std::io::Write,
    ) -> std::io::Result<()> {
        out.write_all(b"PACKDATA")
    }
}

#[derive(Default)]
struct RecordingTransaction {
    applied: Vec<CommandUpdate>,
}

impl RefTransaction for RecordingTransaction {
    fn apply(&mut self, updates: &[CommandUpdate], _atomic: bool) -> Vec<Result<(), String>> {
        self.applied.extend(updates.iter().cloned());
        updates.iter().map(|_| Ok(())).collect()
    }
}

fn entry_header(type_id: u8, mut size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = ((type_id & 0x7) << 4) | (size & 0xf) as u8;
    size >>= 4;
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
    out
}

/// A valid one-blob pack with a correct trailer.
fn tiny_pack(blob: &[u8]) -> Vec<u8> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&1u32.to_be_bytes());
    pack.extend_from_slice(&entry_header(3, blob.len() as u64));
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(blob).unwrap();
    pack.extend_from_slice(&encoder.finish().unwrap());
    let mut hasher = gitwire_hash::Hasher::new();
    hasher.update(&pack);
    let trailer = hasher.finalize();
    pack.extend_from_slice(trailer.as_bytes());
    pack
}

#[test]
fn upload_v0_serves_a_pack_after_immediate_done() {
    let repo = Repo::new(oid(2));
    let session = UploadSession::new(&repo, UploadOptions::default());

    let mut input = Vec::new();
    encode::text_to_write(
        format!("want {} multi_ack_detailed side-band-64k", oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    encode::text_to_write(b"done", &mut input).unwrap();

    let mut output = Vec::new();
    session
        .run_v0(input.as_slice(), &mut output, &mut StubPack, &CancellationFlag::new())
        .unwrap();

    let sent = output.as_bstr();
    assert!(sent.contains_str(b"refs/heads/main"));
    assert!(sent.contains_str(b"multi_ack_detailed"), "advertised capabilities");
    assert!(sent.contains_str(b"NAK"), "no common history means NAK");
    assert!(sent.contains_str(b"PACKDATA"), "pack bytes ride channel 1");
    assert!(sent.contains_str(b"Enumerating objects"), "progress on channel 2");
}

#[test]
fn upload_v0_acknowledges_common_haves() {
    let repo = Repo::new(oid(2));
    let session = UploadSession::new(&repo, UploadOptions::default());

    let mut input = Vec::new();
    encode::text_to_write(
        format!("want {} multi_ack_detailed", oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    encode::text_to_write(format!("have {}", oid(1)).as_bytes(), &mut input).unwrap();
    encode::text_to_write(format!("have {}", oid(9)).as_bytes(), &mut input).unwrap();
    encode::flush_to_write(&mut input).unwrap();
    encode::text_to_write(b"done", &mut input).unwrap();

    let mut output = Vec::new();
    session
        .run_v0(input.as_slice(), &mut output, &mut StubPack, &CancellationFlag::new())
        .unwrap();

    let sent = output.as_bstr();
    assert!(sent.contains_str(format!("ACK {} common", oid(1)).as_bytes()));
    assert!(sent.contains_str(format!("ACK {} ready", oid(1)).as_bytes()));
    assert!(sent.contains_str(format!("ACK {}\n", oid(1)).as_bytes()), "final ACK");
    assert!(!sent.contains_str(format!("ACK {}", oid(9)).as_bytes()), "unknown have is not acked");
}

#[test]
fn upload_v0_refuses_unadvertised_wants() {
    let repo = Repo::new(oid(2));
    let session = UploadSession::new(&repo, UploadOptions::default());

    let mut input = Vec::new();
    encode::text_to_write(format!("want {}", oid(9)).as_bytes(), &mut input).unwrap();
    encode::flush_to_write(&mut input).unwrap();

    let mut output = Vec::new();
    let err = session
        .run_v0(input.as_slice(), &mut output, &mut StubPack, &CancellationFlag::new())
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Protocol);
    assert!(output.as_bstr().contains_str(b"ERR "), "ERR precedes teardown");
    assert!(output.as_bstr().contains_str(b"not our ref"));
}

#[test]
fn upload_quota_on_wants_is_a_resource_error() {
    let repo = Repo::new(oid(2));
    let options = UploadOptions {
        max_wants: Some(1),
        ..Default::default()
    };
    let session = UploadSession::new(&repo, options);

    let mut input = Vec::new();
    encode::text_to_write(format!("want {}", oid(2)).as_bytes(), &mut input).unwrap();
    encode::text_to_write(format!("want {}", oid(1)).as_bytes(), &mut input).unwrap();
    encode::flush_to_write(&mut input).unwrap();

    let mut output = Vec::new();
    let err = session
        .run_v0(input.as_slice(), &mut output, &mut StubPack, &CancellationFlag::new())
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Resource);
    assert!(output.as_bstr().contains_str(b"too many wants"));
}

#[test]
fn upload_hidden_refs_are_not_advertised() {
    let mut repo = Repo::new(oid(2));
    repo.refs.push(Ref::Direct {
        full_ref_name: "refs/internal/ci".into(),
        object: oid(1),
    });
    let options = UploadOptions {
        hidden: std::sync::Arc::new(|record: &gitwire_serve::RefRecord| {
            record.name.starts_with("refs/internal/")
        }),
        advertise_refs_only: true,
        ..Default::default()
    };
    let session = UploadSession::new(&repo, options);

    let mut output = Vec::new();
    session
        .run_v0(&b""[..], &mut output, &mut StubPack, &CancellationFlag::new())
        .unwrap();
    let sent = output.as_bstr();
    assert!(sent.contains_str(b"refs/heads/main"));
    assert!(!sent.contains_str(b"refs/internal/ci"));
}

#[test]
fn upload_v2_ls_refs_then_fetch() {
    let repo = Repo::new(oid(2));
    let session = UploadSession::new(&repo, UploadOptions::default());

    let mut input = Vec::new();
    encode::text_to_write(b"command=ls-refs", &mut input).unwrap();
    encode::delim_to_write(&mut input).unwrap();
    encode::text_to_write(b"peel", &mut input).unwrap();
    encode::flush_to_write(&mut input).unwrap();
    encode::text_to_write(b"command=fetch", &mut input).unwrap();
    encode::delim_to_write(&mut input).unwrap();
    encode::text_to_write(format!("want {}", oid(2)).as_bytes(), &mut input).unwrap();
    encode::text_to_write(format!("have {}", oid(1)).as_bytes(), &mut input).unwrap();
    encode::text_to_write(b"done", &mut input).unwrap();
    encode::flush_to_write(&mut input).unwrap();

    let mut output = Vec::new();
    session
        .run_v2(input.as_slice(), &mut output, &mut StubPack, &CancellationFlag::new())
        .unwrap();

    let sent = output.as_bstr();
    assert!(sent.contains_str(format!("{} refs/heads/main", oid(2)).as_bytes()));
    assert!(sent.contains_str(b"acknowledgments"));
    assert!(sent.contains_str(format!("ACK {}", oid(1)).as_bytes()));
    assert!(sent.contains_str(b"ready"));
    assert!(sent.contains_str(b"packfile"));
    assert!(sent.contains_str(b"PACKDATA"));
}

#[test]
fn receive_applies_a_fast_forward_push() {
    let repo = Repo::new(oid(1));
    let session = ReceiveSession::new(&repo, ReceiveOptions::default());
    let store = MemoryStore::new();
    let mut transaction = RecordingTransaction::default();
    let mut hooks = gitwire_serve::hooks::NoopHooks;

    let mut input = Vec::new();
    encode::text_to_write(
        format!("{} {} refs/heads/main\0report-status", oid(1), oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    input.extend_from_slice(&tiny_pack(b"pushed content"));

    let mut output = Vec::new();
    let report = session
        .run(
            input.as_slice(),
            &mut output,
            &store,
            &mut transaction,
            &mut hooks,
            &CancellationFlag::new(),
        )
        .unwrap()
        .expect("commands were sent");

    assert!(report.unpack_ok());
    assert_eq!(transaction.applied.len(), 1);
    assert_eq!(store.len(), 1, "pushed object landed in the store");
    let sent = output.as_bstr();
    assert!(sent.contains_str(b"unpack ok"));
    assert!(sent.contains_str(b"ok refs/heads/main"));
}

#[test]
fn receive_denies_deletes_when_policy_says_so() {
    let repo = Repo::new(oid(1));
    let options = ReceiveOptions {
        policy: PolicySet::new().with_deny_deletes(true),
        ..Default::default()
    };
    let session = ReceiveSession::new(&repo, options);
    let store = MemoryStore::new();
    let mut transaction = RecordingTransaction::default();
    let mut hooks = gitwire_serve::hooks::NoopHooks;

    let mut input = Vec::new();
    encode::text_to_write(
        format!(
            "{} {} refs/heads/main\0report-status",
            oid(1),
            ObjectId::null()
        )
        .as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();

    let mut output = Vec::new();
    let report = session
        .run(
            input.as_slice(),
            &mut output,
            &store,
            &mut transaction,
            &mut hooks,
            &CancellationFlag::new(),
        )
        .unwrap()
        .expect("commands were sent");

    assert!(transaction.applied.is_empty());
    assert!(output.as_bstr().contains_str(b"ng refs/heads/main deletion prohibited"));
    assert_eq!(report.statuses.len(), 1, "exactly one outcome per command");
}

#[test]
fn receive_atomic_push_fails_as_a_unit() {
    let repo = Repo::new(oid(1));
    let session = ReceiveSession::new(&repo, ReceiveOptions::default());
    let store = MemoryStore::new();
    let mut transaction = RecordingTransaction::default();
    let mut hooks = gitwire_serve::hooks::NoopHooks;

    let mut input = Vec::new();
    // stale: main is at C1, not C9
    encode::text_to_write(
        format!(
            "{} {} refs/heads/main\0report-status atomic",
            oid(9),
            oid(2)
        )
        .as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::text_to_write(
        format!("{} {} refs/heads/new", ObjectId::null(), oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    input.extend_from_slice(&tiny_pack(b"unused"));

    let mut output = Vec::new();
    session
        .run(
            input.as_slice(),
            &mut output,
            &store,
            &mut transaction,
            &mut hooks,
            &CancellationFlag::new(),
        )
        .unwrap();

    assert!(transaction.applied.is_empty(), "atomic batches apply all or nothing");
    let sent = output.as_bstr();
    assert!(sent.contains_str(b"ng refs/heads/main stale info"));
    assert!(sent.contains_str(b"ng refs/heads/new atomic transaction failed"));
}

#[test]
fn receive_reports_unpack_failure_for_every_command() {
    let repo = Repo::new(oid(1));
    let session = ReceiveSession::new(&repo, ReceiveOptions::default());
    let store = MemoryStore::new();
    let mut transaction = RecordingTransaction::default();
    let mut hooks = gitwire_serve::hooks::NoopHooks;

    let mut input = Vec::new();
    encode::text_to_write(
        format!("{} {} refs/heads/main\0report-status", oid(1), oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    input.extend_from_slice(b"JUNK not a pack");

    let mut output = Vec::new();
    let err = session
        .run(
            input.as_slice(),
            &mut output,
            &store,
            &mut transaction,
            &mut hooks,
            &CancellationFlag::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Pack(_)));
    assert!(transaction.applied.is_empty());
    let sent = output.as_bstr();
    assert!(sent.contains_str(b"unpack "));
    assert!(sent.contains_str(b"ng refs/heads/main unpacker error"));
}

struct DecliningHooks;

impl gitwire_serve::hooks::Hooks for DecliningHooks {
    fn pre_receive(
        &mut self,
        _commands: &[CommandUpdate],
        _push_options: &[BString],
    ) -> Result<(), String> {
        Err("maintenance window".into())
    }
}

#[test]
fn receive_pre_receive_hook_rejects_the_batch() {
    let repo = Repo::new(oid(1));
    let session = ReceiveSession::new(&repo, ReceiveOptions::default());
    let store = MemoryStore::new();
    let mut transaction = RecordingTransaction::default();
    let mut hooks = DecliningHooks;

    let mut input = Vec::new();
    encode::text_to_write(
        format!("{} {} refs/heads/main\0report-status", oid(1), oid(2)).as_bytes(),
        &mut input,
    )
    .unwrap();
    encode::flush_to_write(&mut input).unwrap();
    input.extend_from_slice(&tiny_pack(b"content"));

    let mut output = Vec::new();
    session
        .run(
            input.as_slice(),
            &mut output,
            &store,
            &mut transaction,
            &mut hooks,
            &CancellationFlag::new(),
        )
        .unwrap();

    assert!(transaction.applied.is_empty());
    assert!(output
        .as_bstr()
        .contains_str(b"pre-receive hook declined: maintenance window"));
}
