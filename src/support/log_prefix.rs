//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so a prefix
/// created when the connection is accepted picks up the HELO name once the
/// session learns it.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    protocol: String,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                helo: None,
            })),
        }
    }

    pub fn set_helo(&self, host: String) {
        self.inner.lock().unwrap().helo = Some(host);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.protocol)?;
        if let Some(ref helo) = inner.helo {
            write!(f, "[{}]", helo)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_tracks_helo() {
        let prefix = LogPrefix::new("smtp:192.0.2.1:1234".to_owned());
        let clone = prefix.clone();
        assert_eq!("smtp:192.0.2.1:1234", prefix.to_string());

        clone.set_helo("mail.example.com".to_owned());
        assert_eq!(
            "smtp:192.0.2.1:1234[mail.example.com]",
            prefix.to_string(),
        );
    }
}
