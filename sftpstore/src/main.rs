use anyhow::Error;
use std::path::PathBuf;
use structopt::StructOpt;
use tokio::io::{AsyncRead, AsyncWriteExt};

use sftpstore_core::backend::{Backend, BackendError, Consumer, FileReader, FileType, Handle};
use sftpstore_core::config_resolver::resolve_config;
use sftpstore_core::{CancellationToken, SftpBackend};

#[derive(StructOpt)]
struct ObjectOpt {
    /// Object type: config, data, lock, snapshot, index or key
    file_type: FileType,
    /// Object name (ignored for config)
    #[structopt(default_value = "")]
    name: String,
}

impl ObjectOpt {
    fn handle(&self) -> Handle {
        Handle::new(self.file_type, self.name.as_str())
    }
}

#[derive(StructOpt)]
struct CatOpt {
    #[structopt(flatten)]
    object: ObjectOpt,
    /// Number of bytes to print, 0 for everything
    #[structopt(short = "l", long = "length", default_value = "0")]
    length: u64,
    #[structopt(short = "o", long = "offset", default_value = "0")]
    offset: u64,
}

#[derive(StructOpt)]
struct PutOpt {
    file_type: FileType,
    name: String,
    #[structopt(parse(from_os_str))]
    file: PathBuf,
}

#[derive(StructOpt)]
enum Command {
    /// Create a new store: directory tree, no config object yet
    #[structopt(name = "init")]
    Init,
    /// List the objects of one type
    #[structopt(name = "ls")]
    List { file_type: FileType },
    #[structopt(name = "stat")]
    Stat(ObjectOpt),
    /// Print an object to stdout
    #[structopt(name = "cat")]
    Cat(CatOpt),
    /// Upload a local file
    #[structopt(name = "put")]
    Put(PutOpt),
    #[structopt(name = "rm")]
    Remove(ObjectOpt),
    /// Remove everything in the store
    #[structopt(name = "destroy")]
    Destroy,
}

#[derive(StructOpt)]
struct Opt {
    /// Configuration file, if not specified, default to $SFTPSTORE_CONFIG, ~/.sftpstore/config.sane and /etc/sftpstore/config.sane
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config_file: Option<PathBuf>,
    #[structopt(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(e) = _main(opt).await {
        eprintln!("{} - {:?}", e, e);
        std::process::exit(1);
    }
}

async fn _main(opt: Opt) -> Result<(), Error> {
    let config = resolve_config(&opt.config_file)?;
    let backend = match opt.command {
        Command::Init => SftpBackend::create(config).await?,
        _ => SftpBackend::open(config).await?,
    };
    let result = run(&backend, opt.command).await;
    let closed = backend.close().await;
    result?;
    Ok(closed?)
}

async fn run(backend: &SftpBackend, command: Command) -> Result<(), Error> {
    match command {
        Command::Init => println!("Store created"),
        Command::List { file_type } => {
            let cancel = CancellationToken::new();
            backend
                .list(file_type, &cancel, &mut |info| {
                    println!("{}\t{}", info.size, info.name);
                    Ok(())
                })
                .await?;
        }
        Command::Stat(opt) => {
            let info = backend.stat(&opt.handle()).await?;
            println!("{} {} bytes", opt.handle(), info.size);
        }
        Command::Cat(opt) => {
            backend
                .load(&opt.object.handle(), opt.length, opt.offset, &mut Stdout)
                .await?;
        }
        Command::Put(opt) => {
            let handle = Handle::new(opt.file_type, opt.name);
            let mut reader = FileReader::open(&opt.file).await?;
            backend.save(&handle, &mut reader).await?;
            println!("Saved {}", handle);
        }
        Command::Remove(opt) => {
            backend.remove(&opt.handle()).await?;
            println!("Removed {}", opt.handle());
        }
        Command::Destroy => {
            backend.delete(&CancellationToken::new()).await?;
            println!("Store emptied");
        }
    }
    Ok(())
}

/// Streams a loaded object to stdout.
struct Stdout;

#[async_trait::async_trait]
impl Consumer for Stdout {
    async fn consume(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), BackendError> {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(reader, &mut stdout).await?;
        stdout.flush().await?;
        Ok(())
    }
}
