use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_core::{Descriptor, IoContext, OpenMode, ASYNC_IO};
use conduit_io::platform;
use log::info;

mod config;

use config::{Args, Command};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut ctx = IoContext::new(args.context_config()?);
    ctx.initialize().context("initializing I/O context")?;

    let result = match &args.command {
        Command::Info => report(&ctx),
        Command::Cat { files, mapped } => files
            .iter()
            .try_for_each(|path| cat(&mut ctx, path, *mapped)),
        Command::Echo { host, port } => {
            let ip: IpAddr = host
                .parse()
                .with_context(|| format!("invalid host address {host}"))?;
            echo(&mut ctx, SocketAddr::new(ip, *port))
        }
    };

    let torn_down = ctx.teardown().context("tearing down I/O context");
    result.and(torn_down)
}

fn report(ctx: &IoContext) -> Result<()> {
    let width = ctx.socket_length_width();
    let config = ctx.config();
    let lines = [
        format!(
            "socket length: {} bytes ({} bits, {:?})",
            width.bytes(),
            width.bits(),
            width.source()
        ),
        format!("page size: {} bytes", platform::page_size()),
        format!("buffer size: {}", config.default_buffer_size),
        format!("stdout line buffered: {}", config.stdout_line_buffered),
        format!("stderr buffer size: {}", config.stderr_buffer_size),
        format!("async-devel: {}", ASYNC_IO),
    ];

    let stdout = ctx.stdout()?;
    let mut stdout = stdout.borrow_mut();
    for line in lines {
        stdout.write(line.as_bytes())?;
        stdout.write(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

fn cat(ctx: &mut IoContext, path: &Path, mapped: bool) -> Result<()> {
    let d = ctx
        .open(path, OpenMode::Read)
        .with_context(|| format!("opening {}", path.display()))?;
    let copied = copy_to_stdout(ctx, d, mapped);
    let closed = ctx.unregister(d).map_err(anyhow::Error::from);
    let bytes = copied.and_then(|n| closed.map(|_| n))?;
    info!("Copied {} bytes from {}", bytes, path.display());
    Ok(())
}

fn copy_to_stdout(ctx: &IoContext, d: Descriptor, mapped: bool) -> Result<u64> {
    let file = ctx.lookup(d)?;
    let stdout = ctx.stdout()?;
    let mut file = file.borrow_mut();
    let size = file.buffer_size();
    if mapped && size.buffered_capacity().is_some() {
        file.mark_memory_mapped(size)?;
    }

    let mut chunk = [0u8; 512];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        stdout.borrow_mut().write(&chunk[..n])?;
        total += n as u64;
    }
    stdout.borrow_mut().flush()?;
    Ok(total)
}

fn echo(ctx: &mut IoContext, addr: SocketAddr) -> Result<()> {
    let listener = ctx
        .listen(addr)
        .with_context(|| format!("listening on {addr}"))?;
    let local = ctx.lookup(listener)?.borrow().local_addr()?;
    info!("Waiting for one connection on {}", local);

    let (conn, peer) = ctx.accept(listener)?;
    info!("Echoing for {:?}", peer);
    let echoed = echo_lines(ctx, conn);
    ctx.unregister(conn)?;
    ctx.unregister(listener)?;
    let lines = echoed?;
    info!("Connection closed after {} lines", lines);
    Ok(())
}

fn echo_lines(ctx: &IoContext, conn: Descriptor) -> Result<usize> {
    let handle = ctx.lookup(conn)?;
    let mut stream = handle.borrow_mut();
    let mut lines = 0;
    loop {
        let line = stream.read_line()?;
        if line.is_empty() {
            return Ok(lines);
        }
        stream.write(&line)?;
        stream.flush()?;
        lines += 1;
    }
}
