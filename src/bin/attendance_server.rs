//! Development attendance server.
//!
//! Serves a face database JSON file on the database port and logs incoming
//! attendance records, marking each student present once per run.

use class_attendance::service::protocol::{
    self, ATTENDANCE_CHANNEL, DATABASE_CHANNEL, DEFAULT_ATTENDANCE_CHUNK_SIZE,
    DEFAULT_ATTENDANCE_PORT, DEFAULT_DATABASE_CHUNK_SIZE, DEFAULT_DATABASE_PORT,
};
use class_attendance::{ChunkedChannel, FaceDatabase};

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser)]
#[command(name = "attendance-server")]
#[command(about = "Development server for the classroom attendance client")]
struct Args {
    /// JSON object mapping encoding keys to student ids
    database: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_DATABASE_PORT)]
    database_port: u16,

    #[arg(long, default_value_t = DEFAULT_ATTENDANCE_PORT)]
    attendance_port: u16,

    #[arg(long, default_value_t = DEFAULT_DATABASE_CHUNK_SIZE)]
    database_chunk_size: usize,

    #[arg(long, default_value_t = DEFAULT_ATTENDANCE_CHUNK_SIZE)]
    attendance_chunk_size: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();

    let payload = std::fs::read(&args.database)
        .with_context(|| format!("Failed to read {}", args.database.display()))?;
    // refuse to serve something the client would reject
    let database = FaceDatabase::from_payload(&payload)
        .with_context(|| format!("{} is not a valid face database", args.database.display()))?;
    tracing::info!("Serving {} known face(s) from {}", database.len(), args.database.display());

    let database_listener = TcpListener::bind((args.host.as_str(), args.database_port))
        .with_context(|| format!("Failed to bind database port {}", args.database_port))?;
    let attendance_listener = TcpListener::bind((args.host.as_str(), args.attendance_port))
        .with_context(|| format!("Failed to bind attendance port {}", args.attendance_port))?;
    tracing::info!(
        "Listening on {}: database {}, attendance {}",
        args.host, args.database_port, args.attendance_port
    );

    let payload = Arc::new(payload);
    let chunk_size = args.database_chunk_size;
    let database_thread = thread::spawn(move || serve_database(database_listener, payload, chunk_size));

    serve_attendance(attendance_listener, args.attendance_chunk_size);

    database_thread
        .join()
        .map_err(|_| anyhow::anyhow!("Database listener panicked"))?;
    Ok(())
}

fn serve_database(listener: TcpListener, payload: Arc<Vec<u8>>, chunk_size: usize) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                let mut channel = ChunkedChannel::from_stream(DATABASE_CHANNEL, stream, chunk_size);
                match channel.send(&payload) {
                    Ok(()) => tracing::info!("Sent database ({} bytes) to {:?}", payload.len(), peer),
                    Err(e) => tracing::error!("Database send to {:?} failed: {}", peer, e),
                }
                channel.close();
            }
            Err(e) => tracing::error!("Connection error: {}", e),
        }
    }
}

/// One client at a time; the present set spans all connections.
fn serve_attendance(listener: TcpListener, chunk_size: usize) {
    let mut present = HashSet::new();

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_attendance_client(stream, chunk_size, &mut present) {
                    tracing::error!("Attendance client error: {}", e);
                }
            }
            Err(e) => tracing::error!("Connection error: {}", e),
        }
    }
}

fn handle_attendance_client(stream: TcpStream, chunk_size: usize, present: &mut HashSet<String>) -> Result<()> {
    let mut channel = ChunkedChannel::from_stream(ATTENDANCE_CHANNEL, stream, chunk_size);
    tracing::info!("Attendance client connected: {:?}", channel.peer_addr());

    while let Some(message) = channel.receive_next()? {
        for (student, seen_at) in protocol::decode_string_map(&message)? {
            if present.insert(student.clone()) {
                tracing::info!("{} marked present at {}", student, seen_at);
            } else {
                tracing::debug!("{} seen again at {}", student, seen_at);
            }
        }
    }

    tracing::info!("Attendance client disconnected, {} student(s) present", present.len());
    channel.close();
    Ok(())
}
