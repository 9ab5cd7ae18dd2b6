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

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use qjournal_common::LAYOUT_VERSION;
use qjournal_node::{http_router, JournalNode, NodeOption, Server};
use qjournal_proto::NamespaceInfo;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::info;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the journal RPC and segment HTTP endpoints.
    Serve {
        #[clap(long)]
        base_dir: PathBuf,
        #[clap(long, default_value_t = String::from("0.0.0.0:8485"))]
        rpc_endpoint: String,
        #[clap(long, default_value_t = String::from("0.0.0.0:8480"))]
        http_endpoint: String,
    },
    /// Format a journal with its namespace identity. Must run once before
    /// the journal accepts any request.
    Format {
        #[clap(long)]
        base_dir: PathBuf,
        #[clap(long)]
        jid: String,
        #[clap(long)]
        namespace_id: u64,
        #[clap(long)]
        cluster_id: String,
        #[clap(long)]
        block_pool_id: String,
        #[clap(long, default_value_t = 0)]
        creation_time: u64,
    },
}

async fn serve(base_dir: PathBuf, rpc_endpoint: &str, http_endpoint: &str) -> Result<()> {
    let node = JournalNode::new(NodeOption::new(base_dir));

    let rpc_listener = TcpListener::bind(rpc_endpoint).await?;
    let http_listener = TcpListener::bind(http_endpoint).await?;
    node.set_http_port(http_listener.local_addr()?.port()).await;
    info!(
        rpc = %rpc_listener.local_addr()?,
        http = %http_listener.local_addr()?,
        "journal node listening"
    );

    let router = http_router(node.clone());
    let http = tokio::task::spawn(async move { axum::serve(http_listener, router).await });

    let server = Server::new(node);
    tonic::transport::Server::builder()
        .add_service(server.into_service())
        .serve_with_incoming(TcpListenerStream::new(rpc_listener))
        .await?;

    http.abort();
    Ok(())
}

async fn format(
    base_dir: PathBuf,
    jid: &str,
    ns_info: NamespaceInfo,
) -> Result<()> {
    let node = JournalNode::new(NodeOption::new(base_dir));
    let handle = node.get_or_create_journal(jid).await?;
    handle.lock().await.format(&ns_info)?;
    println!("formatted journal {jid}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Command::Serve {
            base_dir,
            rpc_endpoint,
            http_endpoint,
        } => serve(base_dir, &rpc_endpoint, &http_endpoint).await,
        Command::Format {
            base_dir,
            jid,
            namespace_id,
            cluster_id,
            block_pool_id,
            creation_time,
        } => {
            let ns_info = NamespaceInfo {
                namespace_id,
                cluster_id,
                block_pool_id,
                creation_time,
                layout_version: LAYOUT_VERSION,
            };
            format(base_dir, &jid, ns_info).await
        }
    }
}
