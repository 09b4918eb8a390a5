//! Persisted state layout.
//!
//! A snapshot is a header `(magic, version, timestamp)` followed by
//! length-prefixed tagged records: configs, nodes, partitions, jobs,
//! steps, then credential live entries. Load is the inverse; a snapshot
//! written by a newer version is rejected.

use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::error::SlateError;
use crate::cred::{CredentialEngine, LiveEntry};
use crate::state::job::{Job, Step};
use crate::state::node::{ConfigRecord, Node};
use crate::state::partition::Partition;
use crate::state::{StateStore, TableEpochs};
use crate::{JobId, Map};

const SNAPSHOT_MAGIC: u64 = 0x534c_4154_4553_4e50; // "SLATESNP"
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: u64,
    version: u32,
    timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    Config = 1,
    Node = 2,
    Partition = 3,
    Job = 4,
    Step = 5,
    Credential = 6,
    Epochs = 7,
}

impl RecordTag {
    fn from_u8(value: u8) -> Option<RecordTag> {
        Some(match value {
            1 => RecordTag::Config,
            2 => RecordTag::Node,
            3 => RecordTag::Partition,
            4 => RecordTag::Job,
            5 => RecordTag::Step,
            6 => RecordTag::Credential,
            7 => RecordTag::Epochs,
            _ => return None,
        })
    }
}

fn write_record<T: Serialize>(
    out: &mut impl Write,
    tag: RecordTag,
    value: &T,
) -> crate::Result<()> {
    let payload = bincode::serialize(value)?;
    out.write_all(&[tag as u8])?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    Ok(())
}

fn read_record(input: &mut impl Read) -> crate::Result<Option<(RecordTag, Vec<u8>)>> {
    let mut tag_byte = [0u8; 1];
    match input.read_exact(&mut tag_byte) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let tag = RecordTag::from_u8(tag_byte[0])
        .ok_or_else(|| SlateError::SerializationError("unknown snapshot record tag".into()))?;
    let mut len_bytes = [0u8; 4];
    input.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > crate::MAX_SNAPSHOT_SIZE {
        return Err(SlateError::SerializationError(
            "snapshot record too large".into(),
        ));
    }
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    Ok(Some((tag, payload)))
}

pub fn save(store: &StateStore, creds: &CredentialEngine, path: &Path, now: u64) -> crate::Result<()> {
    let tmp = path.with_extension("new");
    let mut out = std::io::BufWriter::new(std::fs::File::create(&tmp)?);

    let header = bincode::serialize(&Header {
        magic: SNAPSHOT_MAGIC,
        version: SNAPSHOT_VERSION,
        timestamp: now,
    })?;
    out.write_all(&(header.len() as u32).to_le_bytes())?;
    out.write_all(&header)?;

    write_record(&mut out, RecordTag::Epochs, &store.epochs())?;
    for config in store.configs() {
        write_record(&mut out, RecordTag::Config, config)?;
    }
    for node in store.raw_nodes() {
        write_record(&mut out, RecordTag::Node, node)?;
    }
    for partition in store.partitions() {
        write_record(&mut out, RecordTag::Partition, partition)?;
    }
    for job in store.jobs() {
        write_record(&mut out, RecordTag::Job, job)?;
        for step in job.steps.values() {
            write_record(&mut out, RecordTag::Step, step)?;
        }
    }
    for entry in creds.export_live() {
        write_record(&mut out, RecordTag::Credential, &entry)?;
    }
    out.flush()?;
    drop(out);
    std::fs::rename(&tmp, path)?;
    log::debug!("State snapshot written to {}", path.display());
    Ok(())
}

pub fn load(path: &Path, creds: &CredentialEngine) -> crate::Result<StateStore> {
    let mut input = std::io::BufReader::new(std::fs::File::open(path)?);

    let mut len_bytes = [0u8; 4];
    input.read_exact(&mut len_bytes)?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > crate::MAX_SNAPSHOT_SIZE {
        return Err(SlateError::SerializationError(
            "snapshot header too large".into(),
        ));
    }
    let mut header_bytes = vec![0u8; header_len];
    input.read_exact(&mut header_bytes)?;
    let header: Header = bincode::deserialize(&header_bytes)?;
    if header.magic != SNAPSHOT_MAGIC {
        return Err(SlateError::SerializationError(
            "snapshot magic mismatch".into(),
        ));
    }
    if header.version > SNAPSHOT_VERSION {
        return Err(SlateError::SerializationError(format!(
            "snapshot version {} is newer than supported {}",
            header.version, SNAPSHOT_VERSION
        )));
    }

    let mut epochs = TableEpochs::default();
    let mut configs: Vec<ConfigRecord> = Vec::new();
    let mut nodes: Vec<Node> = Vec::new();
    let mut partitions: Vec<Partition> = Vec::new();
    let mut jobs: Map<JobId, Job> = Map::default();
    let mut live: Vec<LiveEntry> = Vec::new();

    while let Some((tag, payload)) = read_record(&mut input)? {
        match tag {
            RecordTag::Epochs => epochs = bincode::deserialize(&payload)?,
            RecordTag::Config => configs.push(bincode::deserialize(&payload)?),
            RecordTag::Node => nodes.push(bincode::deserialize(&payload)?),
            RecordTag::Partition => partitions.push(bincode::deserialize(&payload)?),
            RecordTag::Job => {
                let job: Job = bincode::deserialize(&payload)?;
                jobs.insert(job.id, job);
            }
            RecordTag::Step => {
                let step: Step = bincode::deserialize(&payload)?;
                if let Some(job) = jobs.get_mut(&step.job) {
                    job.steps.insert(step.id, step);
                }
            }
            RecordTag::Credential => live.push(bincode::deserialize(&payload)?),
        }
    }

    creds.import_live(live);
    StateStore::restore(configs, nodes, partitions, jobs, epochs)
}
