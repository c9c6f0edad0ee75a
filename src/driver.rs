//! 批处理驱动：把输入源中的每一行转换为一次存储操作，并把结果按行输出
//!
//! 输出格式为 `<key><delim><value>`，每条记录一行；get 不存在的键不输出任何内容。

use crate::engines::{KeyRange, Mode};
use crate::store::DataStore;
use crate::{KvsError, Result};
use slog::Logger;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::str::FromStr;

/// 驱动执行的操作
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// 查询键 (别名 sel, select)
    Get,
    /// 写入键值对 (别名 insert)
    Put,
    /// 删除键 (别名 del, rm, remove)
    Delete,
    /// 按键序输出全部或部分记录
    Dump,
}

impl Operation {
    /// 根据程序名或子命令名解析操作，支持别名
    pub fn from_name(name: &str) -> Option<Operation> {
        match name {
            "get" | "sel" | "select" => Some(Operation::Get),
            "put" | "insert" => Some(Operation::Put),
            "delete" | "del" | "rm" | "remove" => Some(Operation::Delete),
            "dump" => Some(Operation::Dump),
            _ => None,
        }
    }

    /// 操作的规范名称
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::Dump => "dump",
        }
    }

    /// 操作需要的打开模式
    pub fn mode(self) -> Mode {
        match self {
            Operation::Get | Operation::Dump => Mode::ReadOnly,
            Operation::Put | Operation::Delete => Mode::ReadWrite,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 单字节的字段分隔符，默认为制表符
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Delimiter(u8);

impl Delimiter {
    /// 分隔符字节
    pub fn byte(self) -> u8 {
        self.0
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter(b'\t')
    }
}

impl FromStr for Delimiter {
    type Err = KvsError;

    /// 接受单个字节，或者转义形式 `\t`、`\0`；换行不能作为分隔符
    fn from_str(s: &str) -> Result<Delimiter> {
        let byte = match s.as_bytes() {
            [b] => *b,
            b"\\t" => b'\t',
            b"\\0" => 0,
            _ => return Err(KvsError::InvalidDelimiter(s.to_owned())),
        };
        if byte == b'\n' {
            return Err(KvsError::InvalidDelimiter(s.to_owned()));
        }
        Ok(Delimiter(byte))
    }
}

/// 输入源
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// 命令行上直接给出的键 (put 为键值对)
    Args(Vec<Vec<u8>>),
    /// 逐行读取的文件
    File(PathBuf),
    /// 逐行读取标准输入
    Stdin,
}

impl Source {
    /// 输入源在诊断信息中的名称
    pub fn name(&self) -> String {
        match self {
            Source::Args(_) => "arguments".to_owned(),
            Source::File(path) => path.display().to_string(),
            Source::Stdin => "stdin".to_owned(),
        }
    }
}

/// 根据操作、`-f` 文件和位置参数决定输入源
///
/// 所有参数错误都在打开存储之前报告。
pub fn plan_sources(
    operation: Operation,
    files: &[PathBuf],
    args: &[OsString],
) -> Result<Vec<Source>> {
    if operation == Operation::Dump {
        if !args.is_empty() {
            return Err(KvsError::Config(
                "Illegal number of arguments: dump takes no positional arguments".to_owned(),
            ));
        }
        if !files.is_empty() {
            return Err(KvsError::Config("dump does not read input files".to_owned()));
        }
        return Ok(Vec::new());
    }

    if !files.is_empty() && !args.is_empty() {
        return Err(KvsError::Config(
            "input files and positional arguments cannot be combined".to_owned(),
        ));
    }

    if !args.is_empty() {
        if operation == Operation::Put && args.len() % 2 != 0 {
            return Err(KvsError::Config(format!(
                "put expects key/value pairs, got {} arguments",
                args.len()
            )));
        }
        let args = args.iter().map(|arg| os_bytes(arg)).collect();
        return Ok(vec![Source::Args(args)]);
    }

    if files.is_empty() {
        return Ok(vec![Source::Stdin]);
    }

    Ok(files
        .iter()
        .map(|path| {
            if path.as_os_str() == "-" {
                Source::Stdin
            } else {
                Source::File(path.clone())
            }
        })
        .collect())
}

/// 命令行参数的原始字节
#[cfg(unix)]
pub fn os_bytes(s: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    s.as_bytes().to_vec()
}

/// 命令行参数的原始字节
#[cfg(not(unix))]
pub fn os_bytes(s: &OsStr) -> Vec<u8> {
    s.to_string_lossy().into_owned().into_bytes()
}

/// 批处理驱动
pub struct Driver<'s, W: Write> {
    store: &'s mut DataStore,
    operation: Operation,
    delimiter: Delimiter,
    out: W,
    logger: Logger,
}

impl<'s, W: Write> Driver<'s, W> {
    /// 在已打开的存储上执行 `operation`，结果写入 `out`
    pub fn new(
        store: &'s mut DataStore,
        operation: Operation,
        delimiter: Delimiter,
        out: W,
        logger: Logger,
    ) -> Self {
        Driver {
            store,
            operation,
            delimiter,
            out,
            logger,
        }
    }

    /// 依次处理各个输入源，遇到第一个错误即停止
    pub fn run(&mut self, sources: &[Source]) -> Result<()> {
        for source in sources {
            let name = source.name();
            debug!(self.logger, "Processing source"; "op" => %self.operation, "source" => &name);
            let records = match source {
                Source::Args(args) => self.apply_args(args),
                Source::File(path) => match File::open(path) {
                    Ok(file) => self.scan(BufReader::new(file)),
                    Err(e) => Err(e.into()),
                },
                Source::Stdin => {
                    let stdin = io::stdin();
                    let lock = stdin.lock();
                    self.scan(lock)
                }
            }
            .map_err(|e| e.in_input(name.clone()))?;
            debug!(self.logger, "Finished source"; "source" => name, "records" => records);
        }
        Ok(())
    }

    /// 直接处理命令行上的键或键值对，返回处理的记录数
    pub fn apply_args(&mut self, args: &[Vec<u8>]) -> Result<u64> {
        let mut records = 0;
        match self.operation {
            Operation::Put => {
                if args.len() % 2 != 0 {
                    return Err(KvsError::Config(
                        "put expects key/value pairs".to_owned(),
                    ));
                }
                for pair in args.chunks(2) {
                    self.store.put(&pair[0], &pair[1])?;
                    records += 1;
                }
            }
            _ => {
                for key in args {
                    self.apply_key(key)?;
                    records += 1;
                }
            }
        }
        Ok(records)
    }

    /// 逐行处理输入，跳过空行，返回处理的记录数
    pub fn scan<R: BufRead>(&mut self, input: R) -> Result<u64> {
        let mut records = 0;
        for line in input.split(b'\n') {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            self.apply_line(&line)?;
            records += 1;
        }
        Ok(records)
    }

    fn apply_line(&mut self, line: &[u8]) -> Result<()> {
        if self.operation != Operation::Put {
            return self.apply_key(line);
        }
        let delim = self.delimiter.byte();
        match line.iter().position(|&b| b == delim) {
            Some(n) => self.store.put(&line[..n], &line[n + 1..]),
            None => Err(KvsError::MissingDelimiter {
                line: String::from_utf8_lossy(line).into_owned(),
            }),
        }
    }

    fn apply_key(&mut self, key: &[u8]) -> Result<()> {
        match self.operation {
            Operation::Get => {
                if let Some(value) = self.store.get(key)? {
                    write_record(&mut self.out, self.delimiter, key, &value)?;
                }
                Ok(())
            }
            Operation::Delete => self.store.delete(key),
            Operation::Put | Operation::Dump => Err(KvsError::Config(format!(
                "{} does not take single keys",
                self.operation
            ))),
        }
    }

    /// 输出范围内的全部记录，返回输出的记录数
    pub fn dump(&mut self, range: &KeyRange) -> Result<u64> {
        let mut records = 0;
        for record in self.store.dump(range)? {
            let (key, value) = record?;
            write_record(&mut self.out, self.delimiter, &key, &value)?;
            records += 1;
        }
        debug!(self.logger, "Dumped records"; "records" => records);
        Ok(records)
    }

    /// 刷新并返回输出流
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

fn write_record<W: Write>(out: &mut W, delimiter: Delimiter, key: &[u8], value: &[u8]) -> Result<()> {
    out.write_all(key)?;
    out.write_all(&[delimiter.byte()])?;
    out.write_all(value)?;
    out.write_all(b"\n")?;
    Ok(())
}
