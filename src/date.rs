// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! RFC-1123 date formatting for the `Date` response header.

use chrono::DateTime;
use chrono::Utc;

/// Formats a timestamp as an RFC-1123 HTTP date, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// The current time, formatted for a `Date` header.
pub fn http_date_now() -> String {
    format_http_date(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::format_http_date;
    use chrono::TimeZone;
    use chrono::Utc;

    #[test]
    fn rfc1123_format() {
        let when = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_http_date(when), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
