use common::{hash, EntryKind, HashAlgorithm, Options};
use volume::{
    BlockConfig, BlockVolumeReader, BlockVolumeWriter, ContainerKind, FilelistEntry,
    FilesetVolumeReader, FilesetVolumeWriter, IndexVolumeReader, IndexVolumeWriter, RemoteName,
};
use volume::manifest::{IndexBlockRecord, IndexVolumeRecord};

fn config() -> BlockConfig {
    BlockConfig::from_options(&Options::default())
}

fn block_hash(data: &[u8]) -> String {
    hash::to_base64(&HashAlgorithm::Sha256.digest(data))
}

#[test]
fn block_volume_round_trip_with_verification() {
    for container in [ContainerKind::Zip, ContainerKind::TarZstd] {
        let payload_a = vec![0u8; 4096];
        let payload_b = b"short tail block".to_vec();
        let hash_a = block_hash(&payload_a);
        let hash_b = block_hash(&payload_b);

        let mut writer =
            BlockVolumeWriter::create(config(), "silo", container, 1_700_000_000, None).unwrap();
        writer.add_block(&hash_a, &payload_a).unwrap();
        writer.add_block(&hash_b, &payload_b).unwrap();
        let finalized = writer.finalize().unwrap();
        assert_eq!(finalized.payload_size, 4096 + 16);

        let parsed = RemoteName::parse(&finalized.remote_name).unwrap();
        assert_eq!(parsed.container, container);

        let mut reader =
            BlockVolumeReader::open(finalized.staging.path(), container, config(), true).unwrap();
        let mut hashes = reader.block_hashes().unwrap();
        hashes.sort();
        let mut expected = vec![hash_a.clone(), hash_b.clone()];
        expected.sort();
        assert_eq!(hashes, expected);

        assert_eq!(reader.read_block_verified(&hash_a, 4096).unwrap(), payload_a);
        assert_eq!(reader.read_block_verified(&hash_b, 16).unwrap(), payload_b);
        assert!(reader.read_block_verified(&hash_b, 17).is_err());
    }
}

#[test]
fn index_volume_round_trip() {
    let blocklist_payload: Vec<u8> = (0u8..64).collect();
    let blocklist_hash = block_hash(&blocklist_payload);

    let mut writer =
        IndexVolumeWriter::create(config(), "silo", ContainerKind::Zip, 1_700_000_000, None)
            .unwrap();
    let record = IndexVolumeRecord {
        volumename: "silo-19700101T000000Z-abc.dblock.zip".into(),
        volumehash: "vh".into(),
        volumesize: 12345,
        blocks: vec![
            IndexBlockRecord {
                hash: block_hash(b"one"),
                size: 3,
            },
            IndexBlockRecord {
                hash: block_hash(b"four"),
                size: 4,
            },
        ],
    };
    writer.add_volume(&record).unwrap();
    writer.add_blocklist(&blocklist_hash, &blocklist_payload).unwrap();
    let finalized = writer.finalize().unwrap();

    let mut reader =
        IndexVolumeReader::open(finalized.staging.path(), ContainerKind::Zip, config(), true)
            .unwrap();
    let volumes = reader.volumes().unwrap();
    assert_eq!(volumes, vec![record]);

    let blocklists = reader.blocklists().unwrap();
    assert_eq!(blocklists, vec![(blocklist_hash, blocklist_payload)]);
}

#[test]
fn fileset_volume_round_trip_and_partial_marker() {
    let entries = vec![
        FilelistEntry {
            kind: EntryKind::File,
            path: "/data/report.bin".into(),
            hash: Some(block_hash(b"content")),
            size: 7,
            time: 1_650_000_000,
            metahash: block_hash(b"meta"),
            metasize: 4,
            metablockhash: None,
            blocklists: vec![block_hash(b"bl")],
        },
        FilelistEntry {
            kind: EntryKind::Folder,
            path: "/data/sub/".into(),
            hash: None,
            size: 0,
            time: 1_650_000_000,
            metahash: block_hash(b"meta"),
            metasize: 4,
            metablockhash: None,
            blocklists: Vec::new(),
        },
        FilelistEntry {
            kind: EntryKind::Symlink,
            path: "/data/link".into(),
            hash: None,
            size: 0,
            time: 1_650_000_000,
            metahash: block_hash(b"meta2"),
            metasize: 9,
            metablockhash: None,
            blocklists: Vec::new(),
        },
    ];

    let mut writer =
        FilesetVolumeWriter::create(config(), "silo", ContainerKind::Zip, 1_700_000_042, None)
            .unwrap();
    writer.write_filelist(false, &entries).unwrap();
    writer.add_control_file("notes.txt", b"operator notes").unwrap();
    let finalized = writer.finalize().unwrap();
    assert!(finalized.remote_name.contains(".dlist."));

    let mut reader =
        FilesetVolumeReader::open(finalized.staging.path(), ContainerKind::Zip, config(), true)
            .unwrap();
    assert!(!reader.is_full_backup().unwrap());
    assert_eq!(reader.entries().unwrap(), entries);
    assert_eq!(
        reader.control_files().unwrap(),
        vec![("notes.txt".to_string(), b"operator notes".to_vec())]
    );
}

#[test]
fn manifest_mismatch_is_rejected() {
    let mut writer =
        BlockVolumeWriter::create(config(), "silo", ContainerKind::Zip, 0, None).unwrap();
    let h = block_hash(b"x");
    writer.add_block(&h, b"x").unwrap();
    let finalized = writer.finalize().unwrap();

    let foreign = BlockConfig {
        blocksize: 4096,
        block_hash: HashAlgorithm::Sha256,
        file_hash: HashAlgorithm::Sha256,
    };
    let open = BlockVolumeReader::open(finalized.staging.path(), ContainerKind::Zip, foreign, true);
    assert!(open.is_err());

    // Skipping the check opens the same file fine.
    BlockVolumeReader::open(finalized.staging.path(), ContainerKind::Zip, foreign, false).unwrap();
}
