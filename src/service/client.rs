use crate::common::config::ServerConfig;
use crate::common::Result;
use crate::core::database::FaceDatabase;
use crate::service::protocol::ATTENDANCE_CHANNEL;
use crate::service::transport::ChunkedChannel;

/// Where the attendance server lives and how its two channels are framed.
#[derive(Debug, Clone)]
pub struct ServerEndpoint {
    host: String,
    database_port: u16,
    attendance_port: u16,
    database_chunk_size: usize,
    attendance_chunk_size: usize,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self::from_parts(host, &ServerConfig::default())
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Ok(Self::from_parts(config.address()?, config))
    }

    fn from_parts(host: impl Into<String>, config: &ServerConfig) -> Self {
        Self {
            host: host.into(),
            database_port: config.database_port,
            attendance_port: config.attendance_port,
            database_chunk_size: config.database_chunk_size,
            attendance_chunk_size: config.attendance_chunk_size,
        }
    }

    pub fn with_ports(mut self, database_port: u16, attendance_port: u16) -> Self {
        self.database_port = database_port;
        self.attendance_port = attendance_port;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn database_port(&self) -> u16 {
        self.database_port
    }

    pub fn attendance_port(&self) -> u16 {
        self.attendance_port
    }

    /// One-shot download of the session's face database.
    pub fn fetch_database(&self) -> Result<FaceDatabase> {
        FaceDatabase::load(&self.host, self.database_port, self.database_chunk_size)
    }

    /// Long-lived channel for attendance records.
    pub fn open_attendance_channel(&self) -> Result<ChunkedChannel> {
        let channel = ChunkedChannel::connect(
            ATTENDANCE_CHANNEL,
            &self.host,
            self.attendance_port,
            self.attendance_chunk_size,
        )?;
        tracing::info!("Attendance channel open to {}:{}", self.host, self.attendance_port);
        Ok(channel)
    }
}
