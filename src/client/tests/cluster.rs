// Copyright 2026 The QJournal Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end scenarios against in-process journal node clusters.

use std::{path::PathBuf, time::Duration};

use qjournal_client::{QuorumJournalManager, QuorumOption};
use qjournal_common::{layout, record, LAYOUT_VERSION};
use qjournal_node::{build_node, TestNode};
use qjournal_proto::NamespaceInfo;
use tempfile::TempDir;

const JID: &str = "test-journalid";

fn fake_ns() -> NamespaceInfo {
    NamespaceInfo {
        namespace_id: 12345,
        cluster_id: "mycluster".to_owned(),
        block_pool_id: "my-bp".to_owned(),
        creation_time: 0,
        layout_version: LAYOUT_VERSION,
    }
}

fn txn_data(first: u64, num: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    for tx_id in first..first + num {
        record::encode_record(&mut buf, tx_id, format!("tx {}", tx_id).as_bytes());
    }
    buf
}

struct Cluster {
    nodes: Vec<TestNode>,
    dirs: Vec<TempDir>,
}

async fn build_cluster(size: usize) -> Cluster {
    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for _ in 0..size {
        let dir = TempDir::new().unwrap();
        let node = build_node(dir.path()).await.unwrap();
        let handle = node.node.get_or_create_journal(JID).await.unwrap();
        handle.lock().await.format(&fake_ns()).unwrap();
        nodes.push(node);
        dirs.push(dir);
    }
    Cluster { nodes, dirs }
}

impl Cluster {
    fn manager(&self) -> QuorumJournalManager {
        let targets = self.nodes.iter().map(|n| n.rpc_addr.clone()).collect();
        QuorumJournalManager::connect(QuorumOption::default(), JID, fake_ns(), targets)
    }

    fn segment_path(&self, node: usize, name: &str) -> PathBuf {
        self.dirs[node].path().join(JID).join("current").join(name)
    }

    fn count_matching(&self, name: &str, expected: &[u8]) -> usize {
        (0..self.nodes.len())
            .filter(|&i| {
                std::fs::read(self.segment_path(i, name))
                    .map(|bytes| bytes == expected)
                    .unwrap_or(false)
            })
            .count()
    }
}

async fn write_txns(
    stream: &mut qjournal_client::QuorumOutputStream,
    first: u64,
    num: u64,
) -> qjournal_common::Result<()> {
    for tx_id in first..first + num {
        stream.write(tx_id, format!("tx {}", tx_id).as_bytes())?;
    }
    stream.set_ready_to_flush()?;
    stream.flush().await
}

#[tokio::test(flavor = "multi_thread")]
async fn quorum_write_reaches_majority() {
    let cluster = build_cluster(3).await;
    let mut manager = cluster.manager();

    assert_eq!(manager.establish_new_epoch().await.unwrap(), 1);
    assert_eq!(manager.recover_unfinalized_segments().await.unwrap(), None);

    let mut stream = manager.start_log_segment(1).await.unwrap();
    write_txns(&mut stream, 1, 3).await.unwrap();

    // A successful flush means a strict majority holds the synced prefix.
    let matching = cluster.count_matching(&layout::inprogress_name(1), &txn_data(1, 3));
    assert!(matching >= 2, "only {matching} peers hold the flushed edits");
}

#[tokio::test(flavor = "multi_thread")]
async fn http_serves_finalized_segment() {
    let cluster = build_cluster(3).await;
    let mut manager = cluster.manager();
    manager.establish_new_epoch().await.unwrap();
    manager.recover_unfinalized_segments().await.unwrap();

    let mut stream = manager.start_log_segment(1).await.unwrap();
    write_txns(&mut stream, 1, 3).await.unwrap();
    manager.finalize_log_segment(1, 3).await.unwrap();

    // The quorum ack may have raced node 0's finalize; poll briefly.
    let url = format!(
        "http://{}/getimage?filename={}&jid={}",
        cluster.nodes[0].http_addr,
        layout::finalized_name(1, 3),
        JID
    );
    let mut body = None;
    for _ in 0..50 {
        let resp = reqwest::get(&url).await.unwrap();
        if resp.status().is_success() {
            body = Some(resp.bytes().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let body = body.expect("node 0 never finalized the segment");

    let mut expected = LAYOUT_VERSION.to_be_bytes().to_vec();
    expected.extend_from_slice(&txn_data(1, 3));
    assert_eq!(&body[..], &expected[..]);

    let bad_url = format!(
        "http://{}/getimage?filename=edits_xxxDoesNotExist&jid={}",
        cluster.nodes[0].http_addr, JID
    );
    let resp = reqwest::get(&bad_url).await.unwrap();
    assert_eq!(resp.status().as_u16(), 500);
}

#[tokio::test(flavor = "multi_thread")]
async fn writer_change_recovers_the_tail_and_fences_the_old_writer() {
    let cluster = build_cluster(3).await;

    let mut old_manager = cluster.manager();
    assert_eq!(old_manager.establish_new_epoch().await.unwrap(), 1);
    old_manager.recover_unfinalized_segments().await.unwrap();
    let mut old_stream = old_manager.start_log_segment(1).await.unwrap();
    write_txns(&mut old_stream, 1, 3).await.unwrap();

    // A new leader takes over without the old writer finalizing anything.
    let mut new_manager = cluster.manager();
    assert_eq!(new_manager.establish_new_epoch().await.unwrap(), 2);
    let recovered = new_manager.recover_unfinalized_segments().await.unwrap();
    assert_eq!(recovered, Some((1, 3)));

    let finalized = cluster.count_matching(&layout::finalized_name(1, 3), &txn_data(1, 3));
    assert!(finalized >= 2, "only {finalized} peers finalized the recovered tail");

    // The old writer is fenced out with the canonical message.
    old_stream.write(4, b"tx 4").unwrap();
    old_stream.set_ready_to_flush().unwrap();
    let err = old_stream.flush().await.unwrap_err();
    assert!(
        err.to_string()
            .contains("epoch 1 is less than the last promised epoch 2"),
        "{err}"
    );

    // The new writer resumes at the next txid.
    let mut new_stream = new_manager.start_log_segment(4).await.unwrap();
    write_txns(&mut new_stream, 4, 1).await.unwrap();
    let matching = cluster.count_matching(&layout::inprogress_name(4), &txn_data(4, 1));
    assert!(matching >= 2, "only {matching} peers hold the new segment");
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_finalizes_a_previously_accepted_value() {
    let cluster = build_cluster(3).await;
    let ns = fake_ns();
    let req1 = qjournal_proto::RequestInfo::new(JID.to_owned(), ns.clone(), 1, 0);
    let req2 = qjournal_proto::RequestInfo::new(JID.to_owned(), ns.clone(), 2, 0);

    // Epoch 1 writes [1, 2] everywhere; node 0 additionally holds txid 3.
    for node in &cluster.nodes {
        let handle = node.node.get_or_create_journal(JID).await.unwrap();
        let mut journal = handle.lock().await;
        journal.new_epoch(&ns, 1).unwrap();
        journal.start_log_segment(&req1, 1).unwrap();
        journal.journal(&req1, 1, 2, &txn_data(1, 2)).unwrap();
    }
    {
        let handle = cluster.nodes[0].node.get_or_create_journal(JID).await.unwrap();
        let mut journal = handle.lock().await;
        journal.journal(&req1, 3, 1, &txn_data(3, 1)).unwrap();
    }

    // A recovery under epoch 2 accepted [1, 2] on a quorum, then died
    // before finalizing anywhere.
    for node in &cluster.nodes[1..] {
        let handle = node.node.get_or_create_journal(JID).await.unwrap();
        let mut journal = handle.lock().await;
        journal.new_epoch(&ns, 2).unwrap();
        let prep = journal.prepare_recovery(&req2, 1).unwrap();
        let state = prep.segment_state.unwrap();
        assert_eq!((state.start_tx_id, state.end_tx_id), (1, 2));
        journal
            .accept_recovery(&req2, &state, "file:///dev/null")
            .await
            .unwrap();
    }

    // The next recovery must finalize [1, 2], even though node 0's
    // segment is longer.
    let mut manager = cluster.manager();
    assert_eq!(manager.establish_new_epoch().await.unwrap(), 3);
    let recovered = manager.recover_unfinalized_segments().await.unwrap();
    assert_eq!(recovered, Some((1, 2)));

    let finalized = cluster.count_matching(&layout::finalized_name(1, 2), &txn_data(1, 2));
    assert!(finalized >= 2, "only {finalized} peers finalized the accepted value");
    for i in 0..3 {
        assert!(
            !cluster.segment_path(i, &layout::finalized_name(1, 3)).exists(),
            "peer {i} finalized a value that was never accepted"
        );
    }
}
