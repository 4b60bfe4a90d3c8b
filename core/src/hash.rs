// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Hash related utils.

use hmac::Hmac;
use hmac::Mac;
use sha2::Digest;
use sha2::Sha256;

/// Hex encoded SHA256 hash.
///
/// Use this function instead of `hex::encode(sha256(content))` can reduce
/// extra copy.
pub fn hex_sha256(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content).as_slice())
}

/// HMAC with SHA256 hash.
pub fn hmac_sha256(key: &[u8], content: &[u8]) -> Vec<u8> {
    // SAFETY: HMAC's new_from_slice always returns Ok - it handles any key length
    let mut h = Hmac::<Sha256>::new_from_slice(key).unwrap();
    h.update(content);

    h.finalize().into_bytes().to_vec()
}

/// Hex encoded HMAC with SHA256 hash.
///
/// Use this function instead of `hex::encode(hmac_sha256(key, content))` can
/// reduce extra copy.
pub fn hex_hmac_sha256(key: &[u8], content: &[u8]) -> String {
    // SAFETY: HMAC's new_from_slice always returns Ok - it handles any key length
    let mut h = Hmac::<Sha256>::new_from_slice(key).unwrap();
    h.update(content);

    hex::encode(h.finalize().into_bytes())
}

/// Streaming SHA256 accumulator for payloads that arrive in chunks.
///
/// Feed chunks with [`update`] in arrival order, then consume the hasher
/// with [`finalize_hex`] once the last chunk is in. Consumption by value
/// makes feeding data after finalization unrepresentable. Finalizing
/// without any input yields the digest of the empty byte sequence.
///
/// [`update`]: Sha256Hasher::update
/// [`finalize_hex`]: Sha256Hasher::finalize_hex
#[derive(Debug, Default)]
pub struct Sha256Hasher {
    digest: Sha256,
}

impl Sha256Hasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of the payload.
    pub fn update(&mut self, chunk: &[u8]) {
        self.digest.update(chunk);
    }

    /// Consume the hasher and return the hex encoded digest over all
    /// chunks fed so far.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.digest.finalize().as_slice())
    }
}
