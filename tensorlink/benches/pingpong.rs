//! Ping-pong benchmark for the basic channel over the loopback transport.

use std::sync::mpsc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use tensorlink::channel::BasicContext;
use tensorlink::loopback;
use tensorlink::{Endpoint, RecvBuffer, SendBuffer};

fn bench_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("basic_channel");
    for size in [64usize, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("pingpong/{}", size), |b| {
            let (conn_a, conn_b) = loopback::pair();
            let context_a = BasicContext::new();
            let context_b = BasicContext::new();
            let channel_a = context_a.create_channel(conn_a, Endpoint::Connect);
            let channel_b = context_b.create_channel(conn_b, Endpoint::Listen);
            let payload = vec![0xabu8; size];
            let mut out = vec![0u8; size];
            b.iter(|| {
                let (desc_tx, desc_rx) = mpsc::channel();
                let (send_tx, send_rx) = mpsc::channel();
                let buffer = unsafe { SendBuffer::new(payload.as_ptr(), payload.len()) };
                channel_a.send(
                    buffer,
                    move |descriptor| {
                        let _ = desc_tx.send(descriptor);
                    },
                    move |result| {
                        let _ = send_tx.send(result);
                    },
                );
                let descriptor = desc_rx.recv().unwrap().unwrap();

                let (recv_tx, recv_rx) = mpsc::channel();
                let buffer = unsafe { RecvBuffer::new(out.as_mut_ptr(), out.len()) };
                channel_b.recv(descriptor, buffer, move |result| {
                    let _ = recv_tx.send(result);
                });
                recv_rx.recv().unwrap().unwrap();
                send_rx.recv().unwrap().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pingpong);
criterion_main!(benches);
