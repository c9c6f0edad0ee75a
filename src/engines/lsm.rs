//! 日志结构合并 (LSM) 存储引擎
//!
//! ```text
//! put/delete -> [ <gen>.wal ] -> [ memtable ] --flush--> [ <gen>.sst ] --compact--> [ <gen>.base ]
//! get        -> [ memtable ] -> [ sst/base, 从新到旧 ]
//! ```
//!
//! wal 与 sst 文件中的记录都是依次写入的 json 格式 `Operation`，sst 中的记录按键升序排列。
//! 删除以墓碑 (`Operation::Rm`) 记录，只有在合并全部 sst 时才会被丢弃。

use super::{Dump, KeyRange, KvPair, KvsEngine, Mode};
use crate::{KvsError, Result};
use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use slog::Logger;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::iter::Peekable;
use std::ops::{Bound, Range};
use std::path::{Path, PathBuf};

/// memtable 大小上限，超过后写入新的 sst 文件
const MEMTABLE_THRESHOLD: u64 = 1024 * 1024;
/// sst 文件数量超过该值时合并全部 sst
const COMPACTION_TRIGGER: usize = 4;

const WAL_EXT: &str = "wal";
const TABLE_EXT: &str = "sst";
/// 合并产生的 sst，编号更小的 sst 与 wal 都已包含在其中
const BASE_EXT: &str = "base";
const TMP_EXT: &str = "tmp";

type Memtable = SkipMap<Vec<u8>, Option<Vec<u8>>>;
type Readers = HashMap<u64, BufReaderWithPos<File>>;

/// LSM 存储引擎
pub struct LsmEngine {
    // 存储wal与sst文件的目录路径
    path: PathBuf,
    // 最近的写入，None 表示墓碑
    memtable: Memtable,
    // memtable 中键值的字节数
    memtable_size: u64,
    // 按编号从旧到新排列的 sst
    tables: Vec<Table>,
    // sst编号到文件读取器的映射
    readers: Readers,
    // 只读打开或已关闭时为 None
    wal: Option<Wal>,
    current_gen: u64,
    closed: bool,
    logger: Logger,
}

impl LsmEngine {
    /// 打开位于目录 `path` 的 LSM 存储
    pub fn open(path: impl Into<PathBuf>, mode: Mode) -> Result<LsmEngine> {
        LsmEngine::open_with_logger(path, mode, Logger::root(slog::Discard, o!()))
    }

    /// 打开存储，flush 与合并等事件写入 `logger`
    ///
    /// 只读模式下目录不存在或目录中没有任何 wal/sst 时返回 `KvsError::NotFound`，
    /// 并且不会写入任何文件；wal 中残留的记录只在内存中重放。
    ///
    /// 编号小于最新合并表的 sst 与 wal 都已被合并过 (合并后崩溃时可能残留)，
    /// 读写打开时删除，只读打开时忽略。
    pub fn open_with_logger(
        path: impl Into<PathBuf>,
        mode: Mode,
        logger: Logger,
    ) -> Result<LsmEngine> {
        let path: PathBuf = path.into();
        match mode {
            Mode::ReadOnly if !path.is_dir() => return Err(KvsError::NotFound(path)),
            Mode::ReadOnly => {}
            Mode::ReadWrite => {
                fs::create_dir_all(&path)?;
                for gen in sorted_gen_list(&path, TMP_EXT)? {
                    fs::remove_file(file_path(&path, gen, TMP_EXT))?;
                }
            }
        }

        let mut table_files = Vec::new();
        for &ext in &[BASE_EXT, TABLE_EXT] {
            for gen in sorted_gen_list(&path, ext)? {
                table_files.push((gen, ext));
            }
        }
        table_files.sort_unstable();
        let wal_gens = sorted_gen_list(&path, WAL_EXT)?;
        if mode.is_read_only() && table_files.is_empty() && wal_gens.is_empty() {
            return Err(KvsError::NotFound(path));
        }

        let current_gen = table_files
            .iter()
            .map(|&(gen, _)| gen)
            .chain(wal_gens.iter().copied())
            .max()
            .unwrap_or(0);
        let base_gen = table_files
            .iter()
            .filter(|&&(_, ext)| ext == BASE_EXT)
            .map(|&(gen, _)| gen)
            .max()
            .unwrap_or(0);

        let mut stale_files = Vec::new();
        let mut readers = HashMap::new();
        let mut tables = Vec::new();
        for (gen, ext) in table_files {
            if gen < base_gen {
                stale_files.push(file_path(&path, gen, ext));
                continue;
            }
            let mut reader = BufReaderWithPos::new(File::open(file_path(&path, gen, ext))?)?;
            let index = load_table(gen, &mut reader)?;
            readers.insert(gen, reader);
            tables.push(Table { gen, ext, index });
        }

        let memtable = SkipMap::new();
        let mut memtable_size = 0;
        let mut replayed_wals = Vec::new();
        for gen in wal_gens {
            let wal_path = file_path(&path, gen, WAL_EXT);
            if gen < base_gen {
                stale_files.push(wal_path);
                continue;
            }
            let mut reader = BufReaderWithPos::new(File::open(&wal_path)?)?;
            memtable_size += replay_wal(&mut reader, &memtable)?;
            replayed_wals.push(wal_path);
        }

        debug!(logger, "Opened lsm store";
            "path" => %path.display(), "tables" => tables.len(),
            "wal files" => replayed_wals.len(), "stale files" => stale_files.len());

        let mut engine = LsmEngine {
            path,
            memtable,
            memtable_size,
            tables,
            readers,
            wal: None,
            current_gen,
            closed: false,
            logger,
        };

        if mode == Mode::ReadWrite {
            for stale in stale_files {
                warn!(engine.logger, "Removing stale file"; "path" => %stale.display());
                fs::remove_file(stale)?;
            }
            // 上次遗留的wal先落盘为sst，再开始新的wal
            engine.flush_memtable()?;
            for wal_path in replayed_wals {
                fs::remove_file(wal_path)?;
            }
            if engine.tables.len() > COMPACTION_TRIGGER {
                engine.compact()?;
            }
            engine.start_wal()?;
        }

        Ok(engine)
    }

    /// 存储目录
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(KvsError::Closed)
        } else {
            Ok(())
        }
    }

    fn wal(&mut self) -> Result<&mut Wal> {
        self.check_open()?;
        self.wal.as_mut().ok_or(KvsError::ReadOnly)
    }

    fn write(&mut self, op: Operation) -> Result<()> {
        let wal = self.wal()?;
        serde_json::to_writer(&mut wal.writer, &op)?;
        wal.writer.flush()?;

        let (key, value) = match op {
            Operation::Set { key, value } => (key, Some(value)),
            Operation::Rm { key } => (key, None),
        };
        self.memtable_size += (key.len() + value.as_ref().map_or(0, Vec::len)) as u64;
        self.memtable.insert(key, value);

        if self.memtable_size > MEMTABLE_THRESHOLD {
            self.rotate()?;
        }
        Ok(())
    }

    /// 查找键的最新位置，不读取值
    fn locate(&self, key: &[u8]) -> Option<Located> {
        if let Some(entry) = self.memtable.get(key) {
            return Some(Located::Memtable(entry.value().clone()));
        }
        self.tables
            .iter()
            .rev()
            .find_map(|table| table.index.get(key))
            .map(|entry| Located::Table(*entry))
    }

    /// memtable 写入 sst，删除旧wal，必要时合并，最后开始新的wal
    fn rotate(&mut self) -> Result<()> {
        self.flush_memtable()?;
        if let Some(wal) = self.wal.take() {
            let gen = wal.gen;
            drop(wal);
            fs::remove_file(file_path(&self.path, gen, WAL_EXT))?;
        }
        if self.tables.len() > COMPACTION_TRIGGER {
            self.compact()?;
        }
        self.start_wal()
    }

    fn start_wal(&mut self) -> Result<()> {
        self.current_gen += 1;
        let gen = self.current_gen;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path(&self.path, gen, WAL_EXT))?;
        self.wal = Some(Wal {
            gen,
            writer: BufWriterWithPos::new(file)?,
        });
        Ok(())
    }

    /// 把 memtable 按键序写成新的 sst
    fn flush_memtable(&mut self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        self.current_gen += 1;
        let gen = self.current_gen;
        let tmp_path = file_path(&self.path, gen, TMP_EXT);
        let mut writer = BufWriterWithPos::new(File::create(&tmp_path)?)?;

        let mut index = BTreeMap::new();
        for entry in self.memtable.iter() {
            let key = entry.key().clone();
            let op = match entry.value() {
                Some(value) => Operation::Set {
                    key: key.clone(),
                    value: value.clone(),
                },
                None => Operation::Rm { key: key.clone() },
            };
            let pos = writer.pos;
            serde_json::to_writer(&mut writer, &op)?;
            index.insert(
                key,
                TableEntry {
                    pos: (gen, pos..writer.pos).into(),
                    live: entry.value().is_some(),
                },
            );
        }
        writer.flush()?;
        let table_path = file_path(&self.path, gen, TABLE_EXT);
        fs::rename(&tmp_path, &table_path)?;

        info!(self.logger, "Flushed memtable";
            "gen" => gen, "records" => index.len(), "bytes" => self.memtable_size);

        self.readers
            .insert(gen, BufReaderWithPos::new(File::open(&table_path)?)?);
        self.tables.push(Table {
            gen,
            ext: TABLE_EXT,
            index,
        });
        self.memtable = SkipMap::new();
        self.memtable_size = 0;
        Ok(())
    }

    /// 合并全部 sst，丢弃墓碑和被覆盖的记录
    fn compact(&mut self) -> Result<()> {
        self.current_gen += 1;
        let compaction_gen = self.current_gen;
        let tmp_path = file_path(&self.path, compaction_gen, TMP_EXT);
        let mut compaction_writer = BufWriterWithPos::new(File::create(&tmp_path)?)?;

        let mut index = BTreeMap::new();
        let merged = MergeIter::new(None, &self.tables, Bound::Unbounded);
        for (key, located) in merged {
            let entry = match located {
                Located::Table(entry) if entry.live => entry,
                _ => continue,
            };
            let reader = reader_for(&mut self.readers, entry.pos.gen)?;
            reader.seek(SeekFrom::Start(entry.pos.pos))?;
            let mut entry_reader = reader.take(entry.pos.len);
            let new_pos = compaction_writer.pos;
            let len = io::copy(&mut entry_reader, &mut compaction_writer)?;
            index.insert(
                key,
                TableEntry {
                    pos: (compaction_gen, new_pos..new_pos + len).into(),
                    live: true,
                },
            );
        }
        compaction_writer.flush()?;
        // 重命名之后旧 sst 即失效，删除前崩溃时由下次打开清理
        let table_path = file_path(&self.path, compaction_gen, BASE_EXT);
        fs::rename(&tmp_path, &table_path)?;

        let stale_tables = self.tables.len();
        for table in self.tables.drain(..) {
            self.readers.remove(&table.gen);
            fs::remove_file(file_path(&self.path, table.gen, table.ext))?;
        }

        info!(self.logger, "Compacted tables";
            "gen" => compaction_gen, "merged" => stale_tables, "records" => index.len());

        self.readers
            .insert(compaction_gen, BufReaderWithPos::new(File::open(&table_path)?)?);
        self.tables.push(Table {
            gen: compaction_gen,
            ext: BASE_EXT,
            index,
        });
        Ok(())
    }
}

impl KvsEngine for LsmEngine {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Operation::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        match self.locate(key) {
            Some(Located::Memtable(value)) => Ok(value),
            Some(Located::Table(entry)) if entry.live => {
                read_value(&mut self.readers, &entry.pos).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.wal()?;
        let present = match self.locate(key) {
            Some(located) => located.is_live(),
            None => false,
        };
        if !present {
            return Ok(());
        }
        self.write(Operation::Rm { key: key.to_vec() })
    }

    fn dump(&mut self, range: &KeyRange) -> Result<Dump<'_>> {
        self.check_open()?;
        let merged = MergeIter::new(Some(&self.memtable), &self.tables, range.lower_bound());
        Ok(Box::new(LsmCursor {
            merged,
            readers: &mut self.readers,
            range: range.clone(),
        }))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut wal) = self.wal.take() {
            wal.writer.flush()?;
        }
        self.readers.clear();
        debug!(self.logger, "Closed lsm store"; "path" => %self.path.display());
        Ok(())
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(self.logger, "Failed to close lsm store: {}", e);
        }
    }
}

/// 保存在磁盘上的操作
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
enum Operation {
    /// 设置键值对
    Set { key: Vec<u8>, value: Vec<u8> },
    /// 删除键
    Rm { key: Vec<u8> },
}

/// 记录操作在文件中的位置及长度
#[derive(Clone, Copy, Debug)]
struct OperationPos {
    /// 编号
    gen: u64,
    /// 偏移量
    pos: u64,
    /// 长度
    len: u64,
}

impl From<(u64, Range<u64>)> for OperationPos {
    fn from((gen, range): (u64, Range<u64>)) -> Self {
        OperationPos {
            gen,
            pos: range.start,
            len: range.end - range.start,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TableEntry {
    pos: OperationPos,
    // false 表示墓碑
    live: bool,
}

/// 一个不可变的 sst 文件及其在内存中的索引
struct Table {
    gen: u64,
    // TABLE_EXT 或 BASE_EXT
    ext: &'static str,
    index: BTreeMap<Vec<u8>, TableEntry>,
}

struct Wal {
    gen: u64,
    writer: BufWriterWithPos<File>,
}

/// 某个键最新记录所在的位置
#[derive(Debug)]
enum Located {
    Memtable(Option<Vec<u8>>),
    Table(TableEntry),
}

impl Located {
    fn is_live(&self) -> bool {
        match self {
            Located::Memtable(value) => value.is_some(),
            Located::Table(entry) => entry.live,
        }
    }
}

type Source<'a> = Peekable<Box<dyn Iterator<Item = (Vec<u8>, Located)> + 'a>>;

/// 多路归并 memtable 与各个 sst
///
/// 所有来源都从 `start` 开始按键升序前进；同一个键出现在多个来源时取最新来源的记录。
struct MergeIter<'a> {
    // 从新到旧
    sources: Vec<Source<'a>>,
}

impl<'a> MergeIter<'a> {
    fn new(memtable: Option<&'a Memtable>, tables: &'a [Table], start: Bound<Vec<u8>>) -> Self {
        let mut sources: Vec<Source<'a>> = Vec::with_capacity(tables.len() + 1);
        if let Some(memtable) = memtable {
            let iter = memtable
                .range((start.clone(), Bound::Unbounded))
                .map(|entry| (entry.key().clone(), Located::Memtable(entry.value().clone())));
            let iter: Box<dyn Iterator<Item = (Vec<u8>, Located)> + 'a> = Box::new(iter);
            sources.push(iter.peekable());
        }
        for table in tables.iter().rev() {
            let iter = table
                .index
                .range((start.clone(), Bound::Unbounded))
                .map(|(key, entry)| (key.clone(), Located::Table(*entry)));
            let iter: Box<dyn Iterator<Item = (Vec<u8>, Located)> + 'a> = Box::new(iter);
            sources.push(iter.peekable());
        }
        MergeIter { sources }
    }
}

impl<'a> Iterator for MergeIter<'a> {
    type Item = (Vec<u8>, Located);

    fn next(&mut self) -> Option<Self::Item> {
        let min_key = self
            .sources
            .iter_mut()
            .filter_map(|source| source.peek().map(|(key, _)| key.clone()))
            .min()?;

        let mut newest = None;
        for source in self.sources.iter_mut() {
            if source.peek().map_or(false, |(key, _)| *key == min_key) {
                let item = source.next();
                if newest.is_none() {
                    newest = item;
                }
            }
        }
        newest
    }
}

/// dump 游标：跳过墓碑，逐条与上界比较
struct LsmCursor<'a> {
    merged: MergeIter<'a>,
    readers: &'a mut Readers,
    range: KeyRange,
}

impl<'a> Iterator for LsmCursor<'a> {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, located) = self.merged.next()?;
            if self.range.is_past_upper(&key) {
                return None;
            }
            match located {
                Located::Memtable(Some(value)) => return Some(Ok((key, value))),
                Located::Table(entry) if entry.live => {
                    return Some(read_value(self.readers, &entry.pos).map(|value| (key, value)));
                }
                _ => continue,
            }
        }
    }
}

fn reader_for(readers: &mut Readers, gen: u64) -> Result<&mut BufReaderWithPos<File>> {
    readers
        .get_mut(&gen)
        .ok_or_else(|| KvsError::Corrupted(format!("missing table {}", gen)))
}

/// 从 sst 中读取一条 Set 记录的值
fn read_value(readers: &mut Readers, pos: &OperationPos) -> Result<Vec<u8>> {
    let reader = reader_for(readers, pos.gen)?;
    reader.seek(SeekFrom::Start(pos.pos))?;
    let op_reader = reader.take(pos.len);
    if let Operation::Set { value, .. } = serde_json::from_reader(op_reader)? {
        Ok(value)
    } else {
        Err(KvsError::UnexpectedCommandType)
    }
}

/// 根据编号与扩展名返回文件路径
fn file_path(dir: &Path, gen: u64, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", gen, ext))
}

/// 返回给定目录中指定扩展名文件的有序编号数组
fn sorted_gen_list(path: &Path, ext: &str) -> Result<Vec<u64>> {
    let mut gen_list: Vec<u64> = fs::read_dir(path)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_file() && path.extension() == Some(ext.as_ref()))
        .flat_map(|path| {
            path.file_stem()
                .and_then(OsStr::to_str)
                .map(str::parse::<u64>)
        })
        .flatten()
        .collect();
    gen_list.sort_unstable();
    Ok(gen_list)
}

/// 读取单个sst文件，建立键到记录位置的索引
fn load_table(
    gen: u64,
    reader: &mut BufReaderWithPos<File>,
) -> Result<BTreeMap<Vec<u8>, TableEntry>> {
    let mut pos = reader.seek(SeekFrom::Start(0))?;
    let mut stream = Deserializer::from_reader(reader).into_iter::<Operation>();
    let mut index = BTreeMap::new();
    while let Some(op) = stream.next() {
        let new_pos = stream.byte_offset() as u64;
        let (key, live) = match op? {
            Operation::Set { key, .. } => (key, true),
            Operation::Rm { key } => (key, false),
        };
        index.insert(
            key,
            TableEntry {
                pos: (gen, pos..new_pos).into(),
                live,
            },
        );
        pos = new_pos;
    }
    Ok(index)
}

/// 把wal中的记录重放进memtable，返回重放的字节数
///
/// 末尾被截断的记录 (写入时崩溃) 会被忽略。
fn replay_wal(reader: &mut BufReaderWithPos<File>, memtable: &Memtable) -> Result<u64> {
    reader.seek(SeekFrom::Start(0))?;
    let stream = Deserializer::from_reader(reader).into_iter::<Operation>();
    let mut size = 0;
    for op in stream {
        let op = match op {
            Ok(op) => op,
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e.into()),
        };
        let (key, value) = match op {
            Operation::Set { key, value } => (key, Some(value)),
            Operation::Rm { key } => (key, None),
        };
        size += (key.len() + value.as_ref().map_or(0, Vec::len)) as u64;
        memtable.insert(key, value);
    }
    Ok(size)
}

/// 附带偏移量的BufReader
struct BufReaderWithPos<R: Read + Seek> {
    reader: BufReader<R>,
    /// 读取器偏移量
    pos: u64,
}

impl<R: Read + Seek> BufReaderWithPos<R> {
    fn new(mut inner: R) -> Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(BufReaderWithPos {
            reader: BufReader::new(inner),
            pos,
        })
    }
}

impl<R: Read + Seek> Read for BufReaderWithPos<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R: Read + Seek> Seek for BufReaderWithPos<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// 附带偏移量的BufWriter
struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    /// 写入器偏移量
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_files(path: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for &ext in &[TABLE_EXT, BASE_EXT] {
            for gen in sorted_gen_list(path, ext).unwrap() {
                files.push(file_path(path, gen, ext));
            }
        }
        files
    }

    #[test]
    fn wal_is_replayed_on_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.delete(b"a").unwrap();
        engine.close().unwrap();

        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadOnly).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert!(table_files(temp_dir.path()).is_empty());
        drop(engine);

        // 读写打开会把遗留的wal写成sst
        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
        assert_eq!(table_files(temp_dir.path()).len(), 1);
        assert!(engine.memtable.is_empty());
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.get(b"a").unwrap(), None);
    }

    #[test]
    fn tombstone_in_newer_table_shadows_older_value() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
        engine.put(b"k", b"old").unwrap();
        engine.put(b"j", b"kept").unwrap();
        engine.flush_memtable().unwrap();
        engine.delete(b"k").unwrap();
        engine.flush_memtable().unwrap();
        assert_eq!(engine.tables.len(), 2);

        assert_eq!(engine.get(b"k").unwrap(), None);
        let dumped: Vec<KvPair> = engine
            .dump(&KeyRange::all())
            .unwrap()
            .map(|item| item.unwrap())
            .collect();
        assert_eq!(dumped, vec![(b"j".to_vec(), b"kept".to_vec())]);
    }

    #[test]
    fn compaction_drops_tombstones_and_stale_values() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
        for round in 0..3 {
            for i in 0..10 {
                let key = format!("key{}", i);
                let value = format!("value{}-{}", i, round);
                engine.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
            engine.flush_memtable().unwrap();
        }
        engine.delete(b"key3").unwrap();
        engine.flush_memtable().unwrap();

        engine.compact().unwrap();
        assert_eq!(engine.tables.len(), 1);
        assert_eq!(table_files(temp_dir.path()).len(), 1);
        assert_eq!(engine.tables[0].index.len(), 9);
        assert!(engine.tables[0].index.values().all(|entry| entry.live));
        assert_eq!(engine.get(b"key3").unwrap(), None);
        assert_eq!(engine.get(b"key7").unwrap(), Some(b"value7-2".to_vec()));
        engine.close().unwrap();

        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadOnly).unwrap();
        assert_eq!(engine.dump(&KeyRange::all()).unwrap().count(), 9);
    }

    #[test]
    fn memtable_rotates_past_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
        let value = vec![b'x'; 64 * 1024];
        for i in 0..40u32 {
            engine.put(&i.to_be_bytes(), &value).unwrap();
        }
        assert!(!engine.tables.is_empty());
        assert!(engine.memtable_size <= MEMTABLE_THRESHOLD);
        assert_eq!(sorted_gen_list(temp_dir.path(), WAL_EXT).unwrap().len(), 1);
        for i in 0..40u32 {
            assert_eq!(engine.get(&i.to_be_bytes()).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn truncated_wal_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
            engine.put(b"a", b"1").unwrap();
        }
        let wal_gen = sorted_gen_list(temp_dir.path(), WAL_EXT).unwrap()[0];
        let mut wal = OpenOptions::new()
            .append(true)
            .open(file_path(temp_dir.path(), wal_gen, WAL_EXT))
            .unwrap();
        wal.write_all(br#"{"type":"Set","key":[98],"val"#).unwrap();
        drop(wal);

        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadOnly).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), None);
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        LsmEngine::open(temp_dir.path(), Mode::ReadWrite).unwrap();
        let mut engine = LsmEngine::open(temp_dir.path(), Mode::ReadOnly).unwrap();
        assert!(matches!(engine.put(b"a", b"1"), Err(KvsError::ReadOnly)));
        assert!(matches!(engine.delete(b"a"), Err(KvsError::ReadOnly)));
    }

    #[test]
    fn read_only_open_needs_store_files() {
        let temp_dir = TempDir::new().unwrap();
        match LsmEngine::open(temp_dir.path(), Mode::ReadOnly) {
            Err(KvsError::NotFound(p)) => assert_eq!(p, temp_dir.path()),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        fs::write(temp_dir.path().join("notes.txt"), b"not a store").unwrap();
        assert!(matches!(
            LsmEngine::open(temp_dir.path(), Mode::ReadOnly),
            Err(KvsError::NotFound(_))
        ));
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn leftovers_of_interrupted_compaction_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let mut engine = LsmEngine::open(dir, Mode::ReadWrite).unwrap();
        engine.put(b"gone", b"1").unwrap();
        engine.put(b"kept", b"2").unwrap();
        engine.flush_memtable().unwrap();
        engine.delete(b"gone").unwrap();
        engine.flush_memtable().unwrap();

        // 旧 sst 在合并后重新出现，等同于删除旧文件之前崩溃
        let saved: Vec<(PathBuf, Vec<u8>)> = table_files(dir)
            .into_iter()
            .map(|path| {
                let contents = fs::read(&path).unwrap();
                (path, contents)
            })
            .collect();
        assert_eq!(saved.len(), 2);
        engine.compact().unwrap();
        engine.close().unwrap();
        for (path, contents) in saved.iter() {
            fs::write(path, contents).unwrap();
        }
        let tmp_path = file_path(dir, engine.current_gen + 100, TMP_EXT);
        fs::write(&tmp_path, br#"{"type":"Set","key":[1"#).unwrap();

        let mut engine = LsmEngine::open(dir, Mode::ReadOnly).unwrap();
        assert_eq!(engine.get(b"gone").unwrap(), None);
        assert_eq!(engine.dump(&KeyRange::all()).unwrap().count(), 1);
        assert!(saved.iter().all(|(path, _)| path.exists()));
        drop(engine);

        let mut engine = LsmEngine::open(dir, Mode::ReadWrite).unwrap();
        assert_eq!(engine.get(b"gone").unwrap(), None);
        assert_eq!(engine.get(b"kept").unwrap(), Some(b"2".to_vec()));
        assert!(saved.iter().all(|(path, _)| !path.exists()));
        assert!(!tmp_path.exists());
        assert_eq!(table_files(dir).len(), 1);
    }
}
