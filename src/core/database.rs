use crate::common::{AttendanceError, Result};
use crate::core::identity::{FaceEncoding, StudentId};
use crate::service::protocol::{self, DATABASE_CHANNEL};
use crate::service::transport::ChunkedChannel;

/// Known faces for one session, in the order the server sent them.
///
/// Encodings and identities are kept in parallel so the comparator can scan
/// every known encoding in one call.
#[derive(Debug, Clone, Default)]
pub struct FaceDatabase {
    encodings: Vec<FaceEncoding>,
    students: Vec<StudentId>,
}

impl FaceDatabase {
    /// Pulls the database over a fresh connection, which is closed afterwards.
    pub fn load(host: &str, port: u16, chunk_size: usize) -> Result<Self> {
        tracing::info!("Requesting face database from {}:{}", host, port);

        let mut channel = ChunkedChannel::connect(DATABASE_CHANNEL, host, port, chunk_size)?;
        let received = channel.receive();
        channel.close();
        let payload = received?;

        let database = Self::from_payload(&payload)?;
        tracing::info!(
            "Face database received: {} students, {} bytes",
            database.len(),
            payload.len()
        );
        if database.is_empty() {
            tracing::warn!("Face database is empty; every face will resolve to Unknown");
        }
        Ok(database)
    }

    /// Parses `{"(0.1, -0.2, ...)": "<student_id>-<university>", ...}`.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let entries = protocol::decode_string_map(payload)?
            .into_iter()
            .map(|(key, value)| {
                let encoding = parse_encoding_key(&key)?;
                let student = StudentId::new(value.as_str()).ok_or_else(|| {
                    AttendanceError::Protocol(format!(
                        "Invalid student identity {:?} for key {}", value, truncate_key(&key)
                    ))
                })?;
                Ok((encoding, student))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_entries(entries)
    }

    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (FaceEncoding, StudentId)>,
    {
        let mut database = Self::default();

        for (encoding, student) in entries {
            if let Some(dim) = database.dim() {
                if encoding.dim() != dim {
                    return Err(AttendanceError::KeyFormat(format!(
                        "Encoding for {} has {} dimensions, expected {}",
                        student, encoding.dim(), dim
                    )));
                }
            }

            // Same vector under two spellings: the later identity wins, the slot stays put
            match database.encodings.iter().position(|known| *known == encoding) {
                Some(index) => {
                    tracing::warn!(
                        "Duplicate encoding key: {} replaces {}",
                        student, database.students[index]
                    );
                    database.students[index] = student;
                }
                None => {
                    database.encodings.push(encoding);
                    database.students.push(student);
                }
            }
        }

        Ok(database)
    }

    pub fn encodings(&self) -> &[FaceEncoding] {
        &self.encodings
    }

    pub fn student(&self, index: usize) -> Option<&StudentId> {
        self.students.get(index)
    }

    /// Identity bound to an exactly equal key.
    pub fn identity_for(&self, encoding: &FaceEncoding) -> Option<&StudentId> {
        self.encodings
            .iter()
            .position(|known| known == encoding)
            .and_then(|index| self.students.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FaceEncoding, &StudentId)> {
        self.encodings.iter().zip(self.students.iter())
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    pub fn dim(&self) -> Option<usize> {
        self.encodings.first().map(FaceEncoding::dim)
    }
}

/// Parses the textual tuple form of an encoding, e.g. `(0.1, -0.2, 3e-05)`.
///
/// Square brackets, a trailing comma and `np.float64(x)` style element
/// wrappers are accepted as well.
pub fn parse_encoding_key(key: &str) -> Result<FaceEncoding> {
    let trimmed = key.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .or_else(|| trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')))
        .ok_or_else(|| {
            AttendanceError::KeyFormat(format!("Key is not a tuple: {}", truncate_key(key)))
        })?
        .trim();

    let inner = inner.strip_suffix(',').unwrap_or(inner);
    if inner.trim().is_empty() {
        return Err(AttendanceError::KeyFormat(format!("Key has no elements: {}", truncate_key(key))));
    }

    let values = inner
        .split(',')
        .enumerate()
        .map(|(index, element)| {
            let element = element.trim();
            let number = match element.split_once('(') {
                Some((_, wrapped)) => wrapped.strip_suffix(')').unwrap_or(wrapped).trim(),
                None => element,
            };
            number.parse::<f32>().map_err(|_| {
                AttendanceError::KeyFormat(format!(
                    "Element {} ({:?}) of key {} is not a number",
                    index, element, truncate_key(key)
                ))
            })
        })
        .collect::<Result<Vec<f32>>>()?;

    Ok(FaceEncoding::from(values))
}

fn truncate_key(key: &str) -> String {
    const SHOWN: usize = 48;
    if key.chars().count() <= SHOWN {
        key.to_string()
    } else {
        format!("{}...", key.chars().take(SHOWN).collect::<String>())
    }
}
