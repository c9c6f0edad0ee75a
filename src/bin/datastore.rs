use clap::{ArgAction, Args, Parser, Subcommand};
use datastore::{
    os_bytes, plan_sources, DataStore, Delimiter, Driver, Engine, KeyRange, KvsError, Operation,
    Result,
};
use slog::{o, Drain, Level, Logger};
use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::exit;

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        author = env!("CARGO_PKG_AUTHORS"),
        about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 查询键值
    #[command(visible_aliases = ["sel", "select"])]
    Get(KeyArgs),

    /// 写入键值对
    #[command(visible_alias = "insert")]
    Put(KeyArgs),

    /// 删除键
    #[command(visible_aliases = ["del", "rm", "remove"])]
    Delete(KeyArgs),

    /// 按键序输出记录
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// 存储路径
    #[arg(short = 'd', long = "db", env = "DB_HOME")]
    db: PathBuf,

    /// 存储引擎 (sqlite, lsm, btree)，默认为第一个编译进来的引擎
    #[arg(short, long, value_parser = engine_parser)]
    engine: Option<Engine>,

    /// 单字节字段分隔符，可用 \t 与 \0
    #[arg(short = 't', long, default_value = "\\t", value_parser = delimiter_parser)]
    delimiter: Delimiter,

    /// 日志级别，可重复
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Args, Debug)]
struct KeyArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// 逐行读取的输入文件，`-` 表示标准输入，可重复
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,

    /// 键，put 为依次排列的键和值
    args: Vec<OsString>,
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// 下界 (包含)
    #[arg(short = 'L', long)]
    lower: Option<OsString>,

    /// 上界 (包含)
    #[arg(short = 'U', long)]
    upper: Option<OsString>,
}

fn engine_parser(s: &str) -> std::result::Result<Engine, String> {
    Engine::from_name(s).ok_or_else(|| {
        let names: Vec<&str> = Engine::ALL.iter().map(|engine| engine.name()).collect();
        format!("Invalid engine, expected one of: {}", names.join(", "))
    })
}

fn delimiter_parser(s: &str) -> std::result::Result<Delimiter, String> {
    s.parse().map_err(|e: KvsError| e.to_string())
}

/// 一次调用要做的全部工作
struct Request {
    operation: Operation,
    store: StoreArgs,
    files: Vec<PathBuf>,
    args: Vec<OsString>,
    range: KeyRange,
}

impl From<Commands> for Request {
    fn from(command: Commands) -> Request {
        let (operation, keys) = match command {
            Commands::Get(keys) => (Operation::Get, keys),
            Commands::Put(keys) => (Operation::Put, keys),
            Commands::Delete(keys) => (Operation::Delete, keys),
            Commands::Dump(dump) => {
                let lower = dump.lower.as_deref().map(os_bytes);
                let upper = dump.upper.as_deref().map(os_bytes);
                return Request {
                    operation: Operation::Dump,
                    store: dump.store,
                    files: Vec::new(),
                    args: Vec::new(),
                    range: KeyRange::new(lower, upper),
                };
            }
        };
        Request {
            operation,
            store: keys.store,
            files: keys.files,
            args: keys.args,
            range: KeyRange::all(),
        }
    }
}

/// 以 get/put/... 为名的链接调用时，把程序名当作子命令
fn cli_args() -> Vec<OsString> {
    let mut args: Vec<OsString> = env::args_os().collect();
    let invoked_as = args
        .first()
        .and_then(|arg0| Path::new(arg0).file_stem())
        .and_then(OsStr::to_str)
        .filter(|name| Operation::from_name(name).is_some())
        .map(OsString::from);
    if let Some(name) = invoked_as {
        args.insert(1, name);
    }
    args
}

fn build_logger(verbose: u8) -> Logger {
    let level = match verbose {
        0 => Level::Warning,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, o!())
}

fn main() {
    let cli = Cli::parse_from(cli_args());
    let request = Request::from(cli.command);
    let logger = build_logger(request.store.verbose);
    let result = run(request, &logger);
    // 退出前释放logger，让异步日志写完
    drop(logger);
    if let Err(e) = result {
        eprintln!("error: {}", e);
        exit(1);
    }
}

fn run(request: Request, logger: &Logger) -> Result<()> {
    let operation = request.operation;
    let sources = plan_sources(operation, &request.files, &request.args)?;
    let engine = match request.store.engine {
        Some(engine) => engine,
        None => Engine::default_engine()
            .ok_or_else(|| KvsError::Config("no storage engine compiled in".to_owned()))?,
    };

    let mut store = DataStore::open_at(
        engine,
        &request.store.db,
        operation.mode(),
        logger.new(o!("op" => operation.name())),
    )?;

    let stdout = io::stdout();
    let out = BufWriter::new(stdout.lock());
    let mut driver = Driver::new(
        &mut store,
        operation,
        request.store.delimiter,
        out,
        logger.clone(),
    );
    if operation == Operation::Dump {
        driver.dump(&request.range)?;
    } else {
        driver.run(&sources)?;
    }
    driver.finish()?;
    store.close()
}
