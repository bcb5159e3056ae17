use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::error::GridError;
use crate::tile::{MAX_ZOOM, TileCoord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);
    CREATE UNIQUE INDEX IF NOT EXISTS name ON metadata (name);
    CREATE TABLE IF NOT EXISTS tiles (
        zoom_level INTEGER,
        tile_column INTEGER,
        tile_row INTEGER,
        tile_data BLOB
    );
    CREATE UNIQUE INDEX IF NOT EXISTS tile_index ON tiles (zoom_level, tile_column, tile_row);
";

fn ensure_mbtiles_path(path: &Path) -> Result<()> {
    let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    if ext.eq_ignore_ascii_case("mbtiles") {
        Ok(())
    } else {
        anyhow::bail!("only .mbtiles paths are supported: {}", path.display());
    }
}

/// MBTiles stores rows bottom-up.
fn tms_row(tile: TileCoord) -> u32 {
    ((1u64 << tile.zoom) - 1 - tile.y as u64) as u32
}

fn apply_read_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA query_only = ON;
        PRAGMA temp_store = MEMORY;
        PRAGMA synchronous = OFF;
        PRAGMA cache_size = -200000;
        ",
    )
    .context("failed to apply read pragmas")?;
    Ok(())
}

fn select_tile(conn: &Connection, tile: TileCoord) -> Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
        params![tile.zoom, tile.x, tms_row(tile)],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to read tile {tile}"))
}

fn select_metadata(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT name, value FROM metadata")
        .context("prepare metadata")?;
    let mut rows = stmt.query([]).context("query metadata")?;
    let mut metadata = BTreeMap::new();
    while let Some(row) = rows.next().context("read metadata row")? {
        let name: String = row.get(0)?;
        let value: String = row.get(1)?;
        metadata.insert(name, value);
    }
    Ok(metadata)
}

/// Read-only access to an existing MBTiles file.
pub struct MbtilesReader {
    conn: Connection,
    path: PathBuf,
}

impl MbtilesReader {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_mbtiles_path(path)?;
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open mbtiles: {}", path.display()))?;
        apply_read_pragmas(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the tile is not stored.
    pub fn get_tile(&self, tile: TileCoord) -> Result<Option<Vec<u8>>> {
        select_tile(&self.conn, tile)
    }

    /// Every stored tile at `zoom`, sorted by (x, y).
    pub fn list_tiles(&self, zoom: u8) -> Result<Vec<TileCoord>> {
        if zoom > MAX_ZOOM {
            return Err(GridError::InvalidZoomRange(format!("zoom {zoom} is above {MAX_ZOOM}")).into());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT tile_column, tile_row FROM tiles WHERE zoom_level = ?1")
            .context("prepare tile list")?;
        let mut rows = stmt.query(params![zoom]).context("query tile list")?;
        let mut tiles = Vec::new();
        while let Some(row) = rows.next().context("read tile row")? {
            let x: u32 = row.get(0)?;
            let row_index: u32 = row.get(1)?;
            let y = ((1u64 << zoom) - 1)
                .checked_sub(row_index as u64)
                .ok_or(GridError::InvalidTile {
                    zoom,
                    x,
                    y: row_index,
                })?;
            tiles.push(TileCoord::new(zoom, x, y as u32)?);
        }
        tiles.sort();
        Ok(tiles)
    }

    /// Lowest and highest zoom with stored tiles.
    pub fn zoom_range(&self) -> Result<Option<(u8, u8)>> {
        let range: (Option<u8>, Option<u8>) = self
            .conn
            .query_row(
                "SELECT MIN(zoom_level), MAX(zoom_level) FROM tiles",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("query zoom range")?;
        Ok(match range {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        select_metadata(&self.conn)
    }
}

/// Read-write access to the output MBTiles file. Writes are grouped into
/// explicit transactions with `begin`/`commit`.
pub struct MbtilesWriter {
    conn: Connection,
    path: PathBuf,
    wal: bool,
    in_transaction: bool,
}

impl MbtilesWriter {
    /// Creates a new file with the MBTiles schema. Fails if `path` exists.
    pub fn create(path: &Path, busy_timeout: Duration) -> Result<Self> {
        ensure_mbtiles_path(path)?;
        if path.exists() {
            anyhow::bail!("output already exists: {}", path.display());
        }
        Self::open(path, busy_timeout)
    }

    /// Opens (or creates) an MBTiles file for writing. Several writers may
    /// hold the same file when WAL mode is available.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        ensure_mbtiles_path(path)?;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open output mbtiles: {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("failed to set busy timeout")?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("failed to set journal mode")?;
        let wal = mode.eq_ignore_ascii_case("wal");
        if !wal {
            tracing::warn!("{} does not support WAL (journal_mode={})", path.display(), mode);
        }
        conn.execute_batch(SCHEMA)
            .context("failed to create output schema")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            wal,
            in_transaction: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn supports_concurrent_writers(&self) -> bool {
        self.wal
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin output transaction")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn
            .execute_batch("COMMIT")
            .context("commit output")?;
        self.in_transaction = false;
        Ok(())
    }

    /// Discards the open batch. Earlier commits stay.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn
            .execute_batch("ROLLBACK")
            .context("roll back output")
    }

    pub fn put_tile(&self, tile: TileCoord, data: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
                params![tile.zoom, tile.x, tms_row(tile), data],
            )
            .with_context(|| format!("failed to write tile {tile}"))?;
        Ok(())
    }

    /// Writes `tiles` in one transaction, or none of them.
    pub fn put_tiles(&mut self, tiles: &[(TileCoord, Vec<u8>)]) -> Result<()> {
        if tiles.is_empty() {
            return Ok(());
        }
        self.begin()?;
        let written = tiles
            .iter()
            .try_for_each(|(tile, data)| self.put_tile(*tile, data));
        match written {
            Ok(()) => self.commit(),
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    pub fn get_tile(&self, tile: TileCoord) -> Result<Option<Vec<u8>>> {
        select_tile(&self.conn, tile)
    }

    pub fn write_metadata<'a>(
        &mut self,
        entries: impl IntoIterator<Item = (&'a str, String)>,
    ) -> Result<()> {
        self.commit()?;
        let tx = self
            .conn
            .transaction()
            .context("begin metadata transaction")?;
        for (name, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)",
                params![name, value],
            )
            .context("insert metadata")?;
        }
        tx.commit().context("commit metadata")?;
        Ok(())
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        select_metadata(&self.conn)
    }

    pub fn tile_count(&self, zoom: u8) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tiles WHERE zoom_level = ?1",
                params![zoom],
                |row| row.get(0),
            )
            .context("count tiles")?;
        u64::try_from(count).context("negative tile count")
    }
}

/// A batch still open on drop was abandoned by an error, so it is discarded.
impl Drop for MbtilesWriter {
    fn drop(&mut self) {
        if let Err(err) = self.rollback() {
            tracing::warn!("failed to roll back {} on close: {err}", self.path.display());
        }
    }
}

/// Copies `tiles` byte for byte from `source` into `dest`, along with the
/// source's layer description. Missing tiles are skipped. Returns the number
/// of tiles copied.
pub fn copy_base_tiles(
    source: &MbtilesReader,
    dest: &mut MbtilesWriter,
    tiles: &[TileCoord],
    write_batch: usize,
) -> Result<usize> {
    let metadata = source.metadata()?;
    if let Some(json) = metadata.get("json") {
        dest.write_metadata([("json", json.clone())])?;
    }
    let mut copied = 0usize;
    dest.begin()?;
    for tile in tiles.iter() {
        let Some(data) = source.get_tile(*tile)? else {
            continue;
        };
        dest.put_tile(*tile, &data)?;
        copied += 1;
        if copied % write_batch.max(1) == 0 {
            dest.commit()?;
            dest.begin()?;
        }
    }
    dest.commit()?;
    tracing::debug!("copied {copied} base tiles from {}", source.path().display());
    Ok(copied)
}
