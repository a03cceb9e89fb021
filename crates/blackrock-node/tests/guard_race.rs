//! ---
//! br_section: "03-node-lifecycle"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Node agent lifecycle: guard, roles, bootstrap, and restart."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::sync::{Arc, Barrier};
use std::thread;

use blackrock_cluster_rpc::AddressToken;
use blackrock_node::{GuardState, SingletonGuard};
use tempfile::tempdir;

#[test]
fn exactly_one_racer_acquires() {
    let dir = tempdir().unwrap();
    let path = Arc::new(dir.path().join("blackrock-slave"));
    let racers = 8;
    let barrier = Arc::new(Barrier::new(racers));

    let handles: Vec<_> = (0..racers)
        .map(|_| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                SingletonGuard::try_acquire(&path).unwrap()
            })
        })
        .collect();
    let states: Vec<GuardState> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = states
        .iter()
        .filter(|state| matches!(state, GuardState::Acquired(_)))
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn readers_never_see_a_partial_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blackrock-slave");
    let GuardState::Acquired(mut guard) = SingletonGuard::try_acquire(&path).unwrap() else {
        panic!("expected to acquire");
    };
    guard
        .persist(&AddressToken::new("10.0.0.5:1".parse().unwrap()))
        .unwrap();

    let reader_path = path.clone();
    let reader = thread::spawn(move || {
        for _ in 0..500 {
            let token = SingletonGuard::read_token(&reader_path)
                .expect("record must always decode")
                .expect("record must never be empty");
            assert_eq!(token.ip().to_string(), "10.0.0.5");
        }
    });

    for port in 2..500u16 {
        guard
            .persist(&AddressToken::new(format!("10.0.0.5:{port}").parse().unwrap()))
            .unwrap();
    }
    reader.join().unwrap();
}
