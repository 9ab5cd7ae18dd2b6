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

mod fs;
mod http;
mod journal;
mod node;
mod opt;
mod server;
mod storage;

pub use http::router as http_router;
pub use journal::{Journal, PrepareOutcome};
pub use node::{JournalHandle, JournalNode};
pub use opt::NodeOption;
pub use server::Server;
pub use storage::JournalStorage;

#[cfg(debug_assertions)]
pub use bootstrap::{build_node, TestNode};

#[cfg(debug_assertions)]
mod bootstrap {
    use std::path::PathBuf;

    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;

    /// An in-process journal node with both endpoints bound on ephemeral
    /// ports, for tests.
    pub struct TestNode {
        pub node: JournalNode,
        /// RPC endpoint, e.g. `http://127.0.0.1:43251`.
        pub rpc_addr: String,
        /// HTTP endpoint host:port, e.g. `127.0.0.1:39881`.
        pub http_addr: String,
    }

    pub async fn build_node(base_dir: impl Into<PathBuf>) -> qjournal_common::Result<TestNode> {
        let node = JournalNode::new(NodeOption::new(base_dir));

        let rpc_listener = TcpListener::bind("127.0.0.1:0").await?;
        let rpc_addr = format!("http://{}", rpc_listener.local_addr()?);
        let http_listener = TcpListener::bind("127.0.0.1:0").await?;
        let http_port = http_listener.local_addr()?.port();
        node.set_http_port(http_port).await;

        let server = Server::new(node.clone());
        tokio::task::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(server.into_service())
                .serve_with_incoming(TcpListenerStream::new(rpc_listener))
                .await
                .unwrap();
        });

        let router = http_router(node.clone());
        tokio::task::spawn(async move {
            axum::serve(http_listener, router).await.unwrap();
        });

        Ok(TestNode {
            node,
            rpc_addr,
            http_addr: format!("127.0.0.1:{}", http_port),
        })
    }
}
