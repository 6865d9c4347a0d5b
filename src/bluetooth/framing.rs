// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message framing on top of a raw byte stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{BluetoothError, Result};

/// How message boundaries are found in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// A read shorter than the buffer ends the message.
    #[default]
    Chunked,
    /// Messages are terminated by `\n`.
    Line,
}

impl Framing {
    /// Bytes written to the stream for one outgoing message.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Framing::Chunked => data.to_vec(),
            Framing::Line => {
                let mut out = Vec::with_capacity(data.len() + 1);
                out.extend_from_slice(data);
                out.push(b'\n');
                out
            }
        }
    }
}

/// Turns a byte stream into discrete messages.
pub enum MessageReader<R> {
    Chunked { reader: R, buffer: Vec<u8> },
    Line { reader: BufReader<R> },
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, framing: Framing, chunk_size: usize) -> Self {
        match framing {
            Framing::Chunked => MessageReader::Chunked {
                reader,
                buffer: vec![0; chunk_size.max(1)],
            },
            Framing::Line => MessageReader::Line {
                reader: BufReader::new(reader),
            },
        }
    }

    pub fn chunked(reader: R) -> Self {
        Self::new(reader, Framing::Chunked, DEFAULT_CHUNK_SIZE)
    }

    /// Read the next complete message.
    ///
    /// Fails with `ClientDisconnected` when the stream ends before a message
    /// could be delivered.
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        match self {
            MessageReader::Chunked { reader, buffer } => {
                let mut message = Vec::new();
                loop {
                    let n = reader.read(buffer).await?;
                    if n == 0 && message.is_empty() {
                        return Err(BluetoothError::ClientDisconnected);
                    }
                    message.extend_from_slice(&buffer[..n]);
                    // Only a short read ends the message, so a message of an
                    // exact multiple of the buffer size costs one extra read.
                    if n < buffer.len() {
                        break;
                    }
                }
                debug!("Chunked message complete: {} bytes", message.len());
                Ok(message)
            }
            MessageReader::Line { reader } => {
                let mut line = Vec::new();
                let n = reader.read_until(b'\n', &mut line).await?;
                if n == 0 || line.last() != Some(&b'\n') {
                    if !line.is_empty() {
                        debug!("Discarding {} bytes of unterminated line", line.len());
                    }
                    return Err(BluetoothError::ClientDisconnected);
                }
                line.pop();
                Ok(line)
            }
        }
    }
}
