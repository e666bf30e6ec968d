use std::fs;
use std::io::{Read, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};

use conduit_core::{
    BufferFlags, BufferOrigin, ContextConfig, IoContext, IoError, OpenMode, StdBackends,
};
use conduit_io::testing::MemoryBackend;
use conduit_io::BackendKind;
use tempfile::tempdir;

fn context() -> IoContext {
    let mut ctx = IoContext::new(ContextConfig::default());
    let (i, _) = MemoryBackend::new();
    let (o, _) = MemoryBackend::new();
    let (e, _) = MemoryBackend::new();
    ctx.initialize_with(StdBackends {
        stdin: Box::new(i),
        stdout: Box::new(o),
        stderr: Box::new(e),
    })
    .unwrap();
    ctx
}

#[test]
fn file_round_trip_through_the_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.txt");
    let mut ctx = context();

    let d = ctx.open(&path, OpenMode::Write).unwrap();
    {
        let file = ctx.lookup(d).unwrap();
        let mut file = file.borrow_mut();
        assert_eq!(file.backend_kind(), BackendKind::File);
        file.write(b"alpha\nbeta\n").unwrap();
        assert_eq!(file.pending_output(), 11);
    }
    ctx.unregister(d).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"alpha\nbeta\n");

    let d2 = ctx.open(&path, OpenMode::Read).unwrap();
    assert_eq!(d2, d);
    let file = ctx.lookup(d2).unwrap();
    let mut file = file.borrow_mut();
    assert_eq!(file.read_line().unwrap(), b"alpha\n");
    assert_eq!(file.tell().unwrap(), 6);
    file.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read_line().unwrap(), b"alpha\n");
    assert!(file.classify().contains(BufferFlags::HEAP_OWNED | BufferFlags::READ_ROLE));
    assert!(matches!(file.write(b"x"), Err(IoError::Unsupported { .. })));
}

#[test]
fn memory_mapped_file_buffer_is_released_at_unregister() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mapped.bin");
    let mut ctx = context();

    let d = ctx.open(&path, OpenMode::ReadWriteTruncate).unwrap();
    {
        let file = ctx.lookup(d).unwrap();
        let mut file = file.borrow_mut();
        file.mark_memory_mapped(conduit_core::BufferSize::new(100).unwrap())
            .unwrap();
        assert_eq!(file.buffer_origin(), Some(BufferOrigin::MemoryMapped));
        file.write(b"through a mapping").unwrap();
    }
    ctx.unregister(d).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"through a mapping");
}

#[test]
fn opening_a_missing_file_is_a_backend_error() {
    let dir = tempdir().unwrap();
    let mut ctx = context();
    let err = ctx.open(dir.path().join("absent"), OpenMode::Read).unwrap_err();
    assert!(err.is_backend());
    assert_eq!(ctx.table().unwrap().len(), 3);
}

#[test]
fn accept_registers_the_connection() {
    let mut ctx = context();
    let listener = ctx
        .listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .unwrap();
    let addr = ctx.lookup(listener).unwrap().borrow().local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let (conn, peer) = ctx.accept(listener).unwrap();
    assert_eq!(peer, Some(client.local_addr().unwrap()));
    assert_eq!(conn.get(), listener.get() + 1);

    client.write_all(b"hello\n").unwrap();
    let handle = ctx.lookup(conn).unwrap();
    assert_eq!(handle.borrow_mut().read_line().unwrap(), b"hello\n");
    handle.borrow_mut().write(b"bye\n").unwrap();
    handle.borrow_mut().flush().unwrap();
    drop(handle);

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"bye\n");

    ctx.unregister(conn).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn listening_streams_reject_transfers() {
    let mut ctx = context();
    let listener = ctx
        .listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .unwrap();
    let handle = ctx.lookup(listener).unwrap();
    let err = handle.borrow_mut().read(&mut [0u8; 8]).unwrap_err();
    assert!(err.is_backend());
}

#[test]
fn socket_length_width_matches_the_platform() {
    let ctx = context();
    let width = ctx.socket_length_width();
    assert_eq!(width, conduit_core::socket_length_width());
    assert_eq!(width.bytes(), std::mem::size_of::<conduit_core::SockLen>());
}
