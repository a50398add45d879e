use common::{Error, Result, VolumeType};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::container::ContainerKind;

const TIMESTAMP_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

/// Structured remote filename:
/// `<prefix>-<yyyyMMddTHHmmssZ>-<guid>.<type>.<container>[.<encryption>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteName {
    pub prefix: String,
    pub timestamp: i64,
    pub guid: String,
    pub kind: VolumeType,
    pub container: ContainerKind,
    pub encryption: Option<String>,
}

impl RemoteName {
    pub fn generate(
        prefix: &str,
        kind: VolumeType,
        container: ContainerKind,
        timestamp: i64,
        encryption: Option<&str>,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            timestamp,
            guid: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            container,
            encryption: encryption.filter(|e| !e.is_empty()).map(String::from),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let bad = || Error::RemoteList(format!("unrecognized remote name {name:?}"));

        let mut dot_parts = name.split('.');
        let stem = dot_parts.next().ok_or_else(bad)?;
        let kind = dot_parts
            .next()
            .and_then(VolumeType::parse)
            .ok_or_else(bad)?;
        let container = dot_parts
            .next()
            .and_then(ContainerKind::parse)
            .ok_or_else(bad)?;
        let encryption = dot_parts.next().map(String::from);
        if dot_parts.next().is_some() {
            return Err(bad());
        }

        // The guid carries no dashes, so split from the right.
        let (rest, guid) = stem.rsplit_once('-').ok_or_else(bad)?;
        let (prefix, stamp) = rest.rsplit_once('-').ok_or_else(bad)?;
        let timestamp = parse_timestamp(stamp).ok_or_else(bad)?;
        if prefix.is_empty() || guid.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            prefix: prefix.to_string(),
            timestamp,
            guid: guid.to_string(),
            kind,
            container,
            encryption,
        })
    }

    /// Whether `name` plausibly belongs to this application and prefix.
    pub fn matches_prefix(name: &str, prefix: &str) -> bool {
        Self::parse(name)
            .map(|parsed| parsed.prefix == prefix)
            .unwrap_or(false)
    }
}

impl std::fmt::Display for RemoteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}.{}",
            self.prefix,
            format_timestamp(self.timestamp),
            self.guid,
            self.kind.suffix(),
            self.container.extension()
        )?;
        if let Some(encryption) = &self.encryption {
            write!(f, ".{encryption}")?;
        }
        Ok(())
    }
}

fn format_timestamp(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| "19700101T000000Z".to_string())
}

fn parse_timestamp(stamp: &str) -> Option<i64> {
    PrimitiveDateTime::parse(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| dt.assume_utc().unix_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let name = RemoteName::generate("silo", VolumeType::Blocks, ContainerKind::Zip, 1_700_000_000, None);
        let rendered = name.to_string();
        assert!(rendered.starts_with("silo-"));
        assert!(rendered.ends_with(".dblock.zip"));

        let parsed = RemoteName::parse(&rendered).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_encrypted_names_keep_their_suffix() {
        let name = RemoteName::generate(
            "silo",
            VolumeType::Files,
            ContainerKind::TarZstd,
            0,
            Some("aes"),
        );
        let rendered = name.to_string();
        assert!(rendered.ends_with(".dlist.tzst.aes"));
        assert_eq!(RemoteName::parse(&rendered).unwrap().encryption.as_deref(), Some("aes"));
    }

    #[test]
    fn test_timestamp_format() {
        let name = RemoteName {
            prefix: "silo".into(),
            timestamp: 0,
            guid: "abc123".into(),
            kind: VolumeType::Index,
            container: ContainerKind::Zip,
            encryption: None,
        };
        assert_eq!(name.to_string(), "silo-19700101T000000Z-abc123.dindex.zip");
    }

    #[test]
    fn test_rejects_foreign_names() {
        assert!(RemoteName::parse("random.bin").is_err());
        assert!(RemoteName::parse("silo-20200101T000000Z-abc.dweird.zip").is_err());
        assert!(!RemoteName::matches_prefix("other-20200101T000000Z-abc.dblock.zip", "silo"));
        assert!(RemoteName::matches_prefix("silo-20200101T000000Z-abc.dblock.zip", "silo"));
    }

    #[test]
    fn test_prefix_with_dashes_survives() {
        let name = RemoteName::generate(
            "my-backup",
            VolumeType::Blocks,
            ContainerKind::Zip,
            1_600_000_000,
            None,
        );
        let parsed = RemoteName::parse(&name.to_string()).unwrap();
        assert_eq!(parsed.prefix, "my-backup");
    }
}
