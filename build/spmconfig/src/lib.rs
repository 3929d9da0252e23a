// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image description for the SPM.
//!
//! An image is described in TOML: isolation level, invocation model, memory
//! map, and the partitions with their services and interrupts. This crate
//! parses that, checks it, and lowers it to the `abi` descriptors the SPM is
//! built from.
//!
//! ```toml
//! isolation-level = 2
//! model = "ipc"
//! ns-client-id = -1
//!
//! [memory]
//! s-code = { start = 0x1000_0000, end = 0x1008_0000 }
//! # ...
//!
//! [[partitions]]
//! name = "crypto"
//! id = 256
//! kind = "psa-rot"
//! # ...
//!
//! [[partitions.services]]
//! name = "CRYPTO"
//! sid = 0xF000_0010
//! version = 1
//! version-policy = "strict"
//! signal = 0x10
//! ```

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use abi::{
    ImageDesc, InvokeModel, IrqDesc, IsolationLevel, MemRange, MemoryLayout, PartitionDesc,
    PartitionFlags, ServiceDesc, VersionPolicy, SIGNAL_RESERVED_MASK,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SpmConfig {
    pub isolation_level: u8,
    pub model: InvokeModel,
    /// Client id reported for calls from the non-secure partition.
    pub ns_client_id: i32,
    pub memory: MemoryConfig,
    /// Order is significant: it's the order of the SPM's partition table.
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemoryConfig {
    pub s_code: Range<usize>,
    pub s_data: Range<usize>,
    pub ns_code: Range<usize>,
    pub ns_data: Range<usize>,
    pub spm_unpriv_code: Range<usize>,
    pub spm_unpriv_data: Range<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    PsaRot,
    AppRot,
    /// Stands for the non-secure world.
    NonSecure,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    pub id: i32,
    pub kind: PartitionKind,
    pub priority: u8,
    pub entry: usize,
    pub code: Range<usize>,
    pub data: Range<usize>,
    pub stack: Range<usize>,
    /// SIDs this partition may connect to.
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub irqs: Vec<IrqConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub sid: u32,
    pub version: u32,
    pub version_policy: VersionPolicy,
    pub signal: u32,
    #[serde(default)]
    pub non_secure_client: bool,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IrqConfig {
    pub line: u32,
    pub signal: u32,
    /// Entry point of the partition's handler for this line. Required in the
    /// library model.
    #[serde(default)]
    pub handler: Option<usize>,
}

fn mem_range(r: &Range<usize>) -> MemRange {
    MemRange::new(r.start, r.end)
}

fn check_signal(partition: &str, what: &str, signal: u32) -> Result<()> {
    if signal.count_ones() != 1 {
        bail!("{partition}: {what} signal {signal:#x} must have exactly one bit set");
    }
    if signal & SIGNAL_RESERVED_MASK != 0 {
        bail!("{partition}: {what} signal {signal:#x} is reserved");
    }
    Ok(())
}

impl SpmConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn isolation(&self) -> Result<IsolationLevel> {
        IsolationLevel::try_from(self.isolation_level).map_err(|()| {
            anyhow::anyhow!("isolation level must be 1, 2 or 3, not {}", self.isolation_level)
        })
    }

    /// Checks everything the SPM relies on the image description for.
    pub fn validate(&self) -> Result<()> {
        self.isolation()?;
        if self.ns_client_id >= 0 {
            bail!("ns-client-id must be negative");
        }

        let mut ids = BTreeSet::new();
        let mut sids = BTreeSet::new();
        let mut non_secure = 0;
        for p in &self.partitions {
            if p.id == 0 {
                bail!("{}: partition id 0 is reserved", p.name);
            }
            if !ids.insert(p.id) {
                bail!("{}: duplicate partition id {}", p.name, p.id);
            }
            if p.kind == PartitionKind::NonSecure {
                non_secure += 1;
                if p.id > 0 {
                    bail!("{}: non-secure partition needs a negative id", p.name);
                }
                if !p.services.is_empty() {
                    bail!("{}: non-secure partition can't provide services", p.name);
                }
            } else if p.id < 0 {
                bail!("{}: secure partition needs a positive id", p.name);
            }
            if p.kind != PartitionKind::NonSecure
                && (p.stack.start < p.data.start || p.stack.end > p.data.end)
            {
                bail!("{}: stack must lie within the data region", p.name);
            }

            let mut signals = 0u32;
            for s in &p.services {
                check_signal(&p.name, &s.name, s.signal)?;
                if signals & s.signal != 0 {
                    bail!("{}: signal {:#x} used twice", p.name, s.signal);
                }
                signals |= s.signal;
                if !sids.insert(s.sid) {
                    bail!("{}: duplicate SID {:#x}", s.name, s.sid);
                }
            }
            for irq in &p.irqs {
                check_signal(&p.name, "irq", irq.signal)?;
                if signals & irq.signal != 0 {
                    bail!("{}: signal {:#x} used twice", p.name, irq.signal);
                }
                signals |= irq.signal;
                match irq.handler {
                    Some(h) if !p.code.contains(&h) => {
                        bail!("{}: irq {} handler {h:#x} is outside its code", p.name, irq.line);
                    }
                    None if self.model == InvokeModel::Library => {
                        bail!("{}: irq {} needs a handler in the library model", p.name, irq.line);
                    }
                    _ => (),
                }
            }
        }
        if non_secure != 1 {
            bail!("need exactly one non-secure partition, found {non_secure}");
        }

        for p in &self.partitions {
            for dep in &p.dependencies {
                if !sids.contains(dep) {
                    bail!("{}: depends on unknown SID {dep:#x}", p.name);
                }
            }
        }
        Ok(())
    }

    /// Lowers the configuration to the descriptors the SPM runs from.
    ///
    /// The descriptors live for the rest of the program, as they would in
    /// flash.
    pub fn into_image(self) -> Result<&'static ImageDesc> {
        self.validate()?;
        let isolation = self.isolation()?;

        let mut partitions = Vec::with_capacity(self.partitions.len());
        let mut services = Vec::new();
        for p in &self.partitions {
            let mut flags = match p.kind {
                PartitionKind::PsaRot => PartitionFlags::PSA_ROT,
                PartitionKind::AppRot => PartitionFlags::APP_ROT,
                PartitionKind::NonSecure => PartitionFlags::empty(),
            };
            if self.model == InvokeModel::Ipc && p.kind != PartitionKind::NonSecure {
                flags |= PartitionFlags::IPC;
            }
            let irqs: Vec<IrqDesc> = p
                .irqs
                .iter()
                .map(|i| IrqDesc {
                    line: i.line,
                    signal: i.signal,
                    handler: i.handler,
                })
                .collect();
            partitions.push(PartitionDesc {
                id: p.id,
                flags,
                priority: p.priority,
                entry: p.entry,
                code: mem_range(&p.code),
                data: mem_range(&p.data),
                stack: mem_range(&p.stack),
                dependencies: Box::leak(p.dependencies.clone().into_boxed_slice()),
                irqs: Box::leak(irqs.into_boxed_slice()),
            });
            for s in &p.services {
                services.push(ServiceDesc {
                    name: Box::leak(s.name.clone().into_boxed_str()),
                    sid: s.sid,
                    version: s.version,
                    version_policy: s.version_policy,
                    signal: s.signal,
                    non_secure_client: s.non_secure_client,
                    partition_id: p.id,
                });
            }
        }

        let m = &self.memory;
        Ok(Box::leak(Box::new(ImageDesc {
            isolation,
            model: self.model,
            ns_client_id: self.ns_client_id,
            memory: MemoryLayout {
                s_code: mem_range(&m.s_code),
                s_data: mem_range(&m.s_data),
                ns_code: mem_range(&m.ns_code),
                ns_data: mem_range(&m.ns_data),
                spm_unpriv_code: mem_range(&m.spm_unpriv_code),
                spm_unpriv_data: mem_range(&m.spm_unpriv_data),
            },
            partitions: Box::leak(partitions.into_boxed_slice()),
            services: Box::leak(services.into_boxed_slice()),
        })))
    }
}
