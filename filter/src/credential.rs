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

use std::fmt::{Debug, Formatter};

use serde::Deserialize;

/// Credential that holds the access_key and secret_key.
#[derive(Clone, Default, Deserialize)]
pub struct Credential {
    /// Access key id for aws services.
    pub access_key_id: String,
    /// Secret access key for aws services.
    pub secret_access_key: String,
    /// Session token for aws services.
    #[serde(default)]
    pub session_token: Option<String>,
}

impl Credential {
    /// Whether this credential can produce a signature.
    pub fn is_valid(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &Redact(&self.access_key_id))
            .field(
                "secret_access_key",
                &Redact(&self.secret_access_key),
            )
            .field(
                "session_token",
                &Redact(self.session_token.as_deref().unwrap_or_default()),
            )
            .finish()
    }
}

/// Replaces all but the first and last three characters with asterisks,
/// redacting short values entirely. Distinguishable without being leakable.
struct Redact<'a>(&'a str);

impl Debug for Redact<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.len() {
            0 => f.write_str("EMPTY"),
            n if n < 12 => f.write_str("***"),
            n => {
                f.write_str(&self.0[..3])?;
                f.write_str("***")?;
                f.write_str(&self.0[n - 3..])
            }
        }
    }
}
