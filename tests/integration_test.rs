use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use pagevault::catalog::{ColumnInfo, DataType, IndexInfo};
use pagevault::config::{Config, RegistryConfig, WriterConfig};
use pagevault::database::Database;
use pagevault::storage::StorageError;
use pagevault::tier::{BlobOwner, Tier, TierReference};
use tempfile::tempdir;

fn flip_byte(path: &Path, offset: u64) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}

fn owner() -> BlobOwner {
    BlobOwner::new("documents", "body", "42")
}

#[tokio::test]
async fn test_blocks_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("blocks.db");
    {
        let db = Database::create(&path, Config::default()).await?;
        for i in 0..100u32 {
            let payload = vec![(i % 251) as u8; (i as usize) * 97];
            db.write_block(&format!("block/{i:03}"), payload).await?;
        }
        db.delete_block("block/050").await?;
        db.close().await?;
    }

    let db = Database::open(&path, Config::default()).await?;
    assert_eq!(db.blocks().list("block/").len(), 99);
    assert_eq!(db.read_block("block/099")?, vec![(99 % 251) as u8; 99 * 97]);
    assert!(db.read_block("block/050").unwrap_err().is_not_found());
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_tier_placement() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::create(&dir.path().join("tiers.db"), Config::default()).await?;

    let small = db.store(&vec![1u8; 4096], &owner()).await?;
    let medium = db.store(&vec![2u8; 4097], &owner()).await?;
    let large = db.store(&vec![3u8; 256 * 1024 + 1], &owner()).await?;
    assert_eq!(small.tier(), Tier::Inline);
    assert_eq!(medium.tier(), Tier::Overflow);
    assert_eq!(large.tier(), Tier::FileStream);

    assert_eq!(db.load(&medium).await?, vec![2u8; 4097]);
    assert_eq!(db.load(&large).await?, vec![3u8; 256 * 1024 + 1]);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_corrupted_block_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("corrupt.db");
    let db = Database::create(&path, Config::default()).await?;
    let location = db.write_block("victim", vec![9u8; 5000]).await?;

    flip_byte(&path, location.offset + 4500)?;
    assert!(matches!(
        db.read_block("victim"),
        Err(StorageError::Corruption { .. })
    ));
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_corrupted_blob_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::create(&dir.path().join("blob.db"), Config::default()).await?;
    let reference = db.store(&vec![5u8; 300_000], &owner()).await?;
    let TierReference::FileStream(pointer) = &reference else {
        panic!("expected a file reference");
    };

    let blob_path = db.tiers().filestream().root().join(&pointer.relative_path);
    flip_byte(&blob_path, 123_456)?;
    assert!(db.load(&reference).await.unwrap_err().is_corruption());
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_batched_writes_are_durable_after_force_flush() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("batched.db");
    let config = Config::default().with_writer(WriterConfig {
        batch_threshold: 16,
        batch_interval: Duration::from_secs(3600),
        ..WriterConfig::default()
    });
    {
        let db = Database::create(&path, config.clone()).await?;
        let mut handles = Vec::new();
        for i in 0..40 {
            handles.push(db.submit_block(&format!("q{i}"), vec![i as u8; 32]).await?);
        }
        db.force_flush().await?;
        for handle in handles {
            assert!(handle.await?.is_some());
        }
        db.halt().await?;
    }

    let db = Database::open(&path, config).await?;
    for i in 0..40 {
        assert_eq!(db.read_block(&format!("q{i}"))?, vec![i as u8; 32]);
    }
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_schema_survives_cold_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("schema.db");
    let columns = vec![
        ColumnInfo::new("id", DataType::Int64).not_null(),
        ColumnInfo::new("title", DataType::Varchar),
        ColumnInfo::new("body", DataType::Bytes),
    ];
    let indexes = vec![IndexInfo::new("documents_pk", &["id"]).unique()];
    let created = {
        let db = Database::create(&path, Config::default()).await?;
        let created = db
            .create_table("documents", columns, indexes)
            .await?;
        db.halt().await?;
        created
    };

    let db = Database::open(&path, Config::default()).await?;
    assert_eq!(db.list_tables()?, vec!["documents".to_string()]);
    assert_eq!(db.load_table("documents")?, created);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_orphan_sweep_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sweep.db");
    let big = vec![8u8; 400_000];
    {
        let db = Database::create(&path, Config::default()).await?;
        db.put_value("kept", &big, &owner()).await?;
        db.put_value("dropped", &big, &owner()).await?;
        // Leaves the blob file behind while forgetting its reference.
        db.delete_block("__values/dropped").await?;
        db.close().await?;
    }

    let db = Database::open(&path, Config::default()).await?;
    let fresh = db.sweep_orphans(SystemTime::now()).await?;
    assert_eq!(fresh.retained, 1);
    assert!(fresh.removed.is_empty());

    let later = SystemTime::now() + Duration::from_secs(30 * 24 * 60 * 60);
    let report = db.sweep_orphans(later).await?;
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.bytes_reclaimed, big.len() as u64);
    assert_eq!(db.get_value("kept").await?, big);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_mixed_tier_scenario() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("scenario.db");
    let slow_snapshots = Config::default().with_registry(RegistryConfig {
        flush_threshold: 10_000,
        flush_interval: Duration::from_secs(3600),
    });

    let inline_value: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();
    {
        let db = Database::create(&path, slow_snapshots.clone()).await?;

        let inline = db.put_value("inline", &inline_value, &owner()).await?;
        assert_eq!(inline.tier(), Tier::Inline);

        let overflow = db.put_value("overflow", &vec![0x41u8; 50_000], &owner()).await?;
        let TierReference::Overflow { head, .. } = overflow else {
            panic!("expected an overflow reference");
        };
        assert_eq!(db.tiers().overflow().chain_len(head)?, 13);

        let file = db.put_value("file", &vec![0x5Au8; 1_000_000], &owner()).await?;
        let TierReference::FileStream(pointer) = &file else {
            panic!("expected a file reference");
        };
        assert_eq!(pointer.size, 1_000_000);
        assert_eq!(db.get_value("file").await?.len(), 1_000_000);

        // Damage the payload of the fifth overflow page.
        flip_byte(&path, head.offset() + 4 * 4096 + 100)?;
        assert!(matches!(
            db.get_value("overflow").await,
            Err(StorageError::Corruption { .. })
        ));

        db.force_flush().await?;
        db.halt().await?;
    }

    let db = Database::open(&path, slow_snapshots).await?;
    assert_eq!(db.get_value("inline").await?, inline_value);
    db.close().await?;
    Ok(())
}
