//! Channel catalog of a dataset.
//!
//! A channel is a `(group, class, label)` triple observed in the data view.
//! Channels that share a group can be packed under one [`ChannelGroup`]
//! entry, whose coverage summary compares the labels present in the lake
//! with the labels the metadata collaborator says the group is made of.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::metadata::ChannelMetadata;

/// One observed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Parent group, if the readings were written with one.
    pub group: Option<String>,
    /// Sensor class.
    pub class: String,
    /// Channel label.
    pub label: String,
    /// Descriptive metadata, when requested and known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChannelMetadata>,
}

/// Channels sharing one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    /// Group name.
    pub group: String,
    /// Member channels present in the lake, by label.
    pub channels: Vec<Channel>,
    /// Number of member labels present in the lake.
    pub present: usize,
    /// Number of member labels known for the group: present ones plus the
    /// children listed in the group's metadata.
    pub available: usize,
    /// Children listed in the group's metadata without any reading.
    pub missing: Vec<String>,
    /// Descriptive metadata of the group itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChannelMetadata>,
}

/// One entry of a channel catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEntry {
    /// A channel listed on its own.
    Channel(Channel),
    /// A packed group.
    Group(ChannelGroup),
}

impl ChannelEntry {
    /// Group name or label, used for ordering and display.
    pub fn name(&self) -> &str {
        match self {
            ChannelEntry::Channel(c) => &c.label,
            ChannelEntry::Group(g) => &g.group,
        }
    }
}

/// Channels of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCatalog {
    /// Dataset the channels belong to.
    pub dataset: String,
    /// Entries ordered by name.
    pub entries: Vec<ChannelEntry>,
}

impl ChannelCatalog {
    /// Every channel, whether listed alone or inside a group.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.entries.iter().flat_map(|e| match e {
            ChannelEntry::Channel(c) => std::slice::from_ref(c).iter(),
            ChannelEntry::Group(g) => g.channels.iter(),
        })
    }
}

/// How [`crate::DivePond::get_available_channels`] shapes its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Attach metadata records to channels and groups.
    pub include_metadata: bool,
    /// Pack channels that share a group into one entry.
    pub pack_groups: bool,
    /// Consult the metadata collaborator at all. When off, groups report
    /// only the labels present in the lake.
    pub load_metadata: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            include_metadata: false,
            pack_groups: true,
            load_metadata: true,
        }
    }
}

/// Arrange channels into catalog entries.
///
/// `group_metadata` holds the records known for group names; only their
/// `children` lists are consulted here.
pub(crate) fn arrange(
    channels: Vec<Channel>,
    pack_groups: bool,
    group_metadata: &BTreeMap<String, ChannelMetadata>,
    include_metadata: bool,
) -> Vec<ChannelEntry> {
    let mut entries = Vec::new();
    let mut groups: BTreeMap<String, Vec<Channel>> = BTreeMap::new();

    for channel in channels {
        match (&channel.group, pack_groups) {
            (Some(group), true) => groups.entry(group.clone()).or_default().push(channel),
            _ => entries.push(ChannelEntry::Channel(channel)),
        }
    }

    for (group, mut members) in groups {
        members.sort_by(|a, b| a.label.cmp(&b.label));
        let present: BTreeSet<&str> = members.iter().map(|c| c.label.as_str()).collect();
        let metadata = group_metadata.get(&group);
        let missing: Vec<String> = metadata
            .map(|m| {
                m.children
                    .iter()
                    .filter(|child| !present.contains(child.as_str()))
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();

        entries.push(ChannelEntry::Group(ChannelGroup {
            present: present.len(),
            available: present.len() + missing.len(),
            missing,
            metadata: metadata.filter(|_| include_metadata).cloned(),
            channels: members,
            group,
        }));
    }

    entries.sort_by(|a, b| a.name().cmp(b.name()));
    entries
}
