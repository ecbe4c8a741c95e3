//! End-to-end IPCQ scenarios, mirroring the FFQ suite plus the spinning
//! command path.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cleanq::ipcq::{self, IpcqConfig};
use cleanq::queue::CTRL_CAPACITY;
use cleanq::{Descriptor, Error, RegionCap, RegionId};

fn unique(tag: &str) -> String {
    format!("/cleanq-ipcq-{}-{}", tag, std::process::id())
}

fn retry_dequeue<B: cleanq::Backend>(q: &mut cleanq::Queue<B>) -> Descriptor {
    loop {
        match q.dequeue() {
            Ok(desc) => return desc,
            Err(Error::QueueEmpty) => thread::yield_now(),
            Err(err) => panic!("dequeue failed: {err}"),
        }
    }
}

#[test]
fn echo_32_descriptors() {
    let name = unique("echo");
    let mut client = ipcq::queue(&name, &IpcqConfig::default()).unwrap();

    let rid = client
        .register(RegionCap::new(0x10_0000, 0x10_0000, 64 * 2048))
        .unwrap();

    let mut sent = Vec::new();
    for i in 0..32u64 {
        let mut desc = Descriptor::new(rid, i * 2048, 2048);
        desc.valid_data = i % 5;
        desc.valid_length = 2048 - desc.valid_data;
        client.enqueue(desc).unwrap();
        sent.push(desc);
    }

    let server_name = name.clone();
    let server = thread::spawn(move || {
        let mut server = ipcq::queue(&server_name, &IpcqConfig::default()).unwrap();
        let mut echoed = 0;
        while echoed < 32 {
            match server.dequeue() {
                Ok(desc) => {
                    server.enqueue(desc).unwrap();
                    echoed += 1;
                }
                Err(Error::QueueEmpty) => thread::yield_now(),
                Err(err) => panic!("server dequeue failed: {err}"),
            }
        }
        assert_eq!(server.pool().num_regions(), 1, "REGISTER was mirrored");
    });

    for expected in &sent {
        assert_eq!(retry_dequeue(&mut client), *expected);
    }
    assert_eq!(client.dequeue(), Err(Error::QueueEmpty));

    server.join().unwrap();
}

#[test]
fn usable_capacity_is_one_less_than_slots() {
    let name = unique("capacity");
    let mut client = ipcq::queue(&name, &IpcqConfig::default()).unwrap();
    let mut server = ipcq::queue(&name, &IpcqConfig::default()).unwrap();

    assert_eq!(client.control(CTRL_CAPACITY, 0), Ok(63));

    let rid = client.register(RegionCap::new(0, 0, 128 * 2048)).unwrap();
    // Drain the REGISTER command to free its slot.
    assert_eq!(server.dequeue(), Err(Error::QueueEmpty));

    for i in 0..63u64 {
        client.enqueue(Descriptor::new(rid, i * 2048, 2048)).unwrap();
    }
    assert_eq!(
        client.enqueue(Descriptor::new(rid, 63 * 2048, 2048)),
        Err(Error::QueueFull)
    );

    server.dequeue().unwrap();
    client.enqueue(Descriptor::new(rid, 63 * 2048, 2048)).unwrap();
    assert_eq!(
        client.enqueue(Descriptor::new(rid, 64 * 2048, 2048)),
        Err(Error::QueueFull)
    );
}

#[test]
fn register_then_data_in_one_pass() {
    let name = unique("cmd-mux");
    let mut client = ipcq::queue(&name, &IpcqConfig::default()).unwrap();

    let cap = RegionCap::new(0x20_0000, 0x4000_0000, 0x8000);
    let rid = client.register(cap).unwrap();
    client.enqueue(Descriptor::new(rid, 0x1000, 0x1000)).unwrap();

    let mut server = ipcq::queue(&name, &IpcqConfig::default()).unwrap();
    let seen: Arc<Mutex<Vec<(RegionId, RegionCap)>>> = Arc::default();
    let seen_cb = seen.clone();
    server.on_region_registered(move |rid, cap| {
        seen_cb.lock().unwrap().push((rid, cap));
    });

    let desc = server.dequeue().unwrap();
    assert_eq!(desc, Descriptor::new(rid, 0x1000, 0x1000));
    assert_eq!(seen.lock().unwrap().as_slice(), &[(rid, cap)]);
}

#[test]
fn deregister_reaches_the_peer() {
    let name = unique("dereg");
    let mut client = ipcq::queue(&name, &IpcqConfig::default()).unwrap();
    let mut server = ipcq::queue(&name, &IpcqConfig::default()).unwrap();

    let rid = client.register(RegionCap::new(0, 0, 0x1000)).unwrap();
    let cap = client.deregister(rid).unwrap();
    assert_eq!(cap.len, 0x1000);

    assert_eq!(server.dequeue(), Err(Error::QueueEmpty));
    assert_eq!(server.pool().num_regions(), 0);
}

#[test]
fn register_spins_through_a_full_ring() {
    let name = unique("spin");
    let mut client = ipcq::queue(&name, &IpcqConfig::default()).unwrap();
    let mut server = ipcq::queue(&name, &IpcqConfig::default()).unwrap();

    let rid = client.register(RegionCap::new(0, 0, 0x100_0000)).unwrap();
    assert_eq!(server.dequeue(), Err(Error::QueueEmpty));

    // Saturate the client's transmit ring.
    for i in 0..63u64 {
        client.enqueue(Descriptor::new(rid, i * 2048, 2048)).unwrap();
    }
    assert_eq!(
        client.enqueue(Descriptor::new(rid, 63 * 2048, 2048)),
        Err(Error::QueueFull)
    );

    // The registration command must wait for a slot rather than fail; it
    // completes once the server drains one message.
    let registrar = thread::spawn(move || {
        let rid2 = client
            .register(RegionCap::new(0x9000_0000, 0x9000_0000, 0x1000))
            .unwrap();
        (client, rid2)
    });

    thread::sleep(Duration::from_millis(20));
    server.dequeue().unwrap();

    let (_client, rid2) = registrar.join().unwrap();

    // Drain the remaining data; the REGISTER command is applied in passing.
    let mut drained = 1;
    while drained < 63 {
        match server.dequeue() {
            Ok(_) => drained += 1,
            Err(Error::QueueEmpty) => thread::yield_now(),
            Err(err) => panic!("drain failed: {err}"),
        }
    }
    assert_eq!(server.dequeue(), Err(Error::QueueEmpty));
    assert_eq!(server.pool().num_regions(), 2);
    assert!(server.pool().get(rid2).is_some());
}
