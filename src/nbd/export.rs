use chrono::{DateTime, Utc};

/// NBD export names must stay within 63 bytes. The canonical form is
/// `backup-{context_id}-disk{i}-{type}-{YYYYMMDDTHHMMSS}`; when that
/// overflows, the context id is truncated from the right until it fits.
pub const MAX_EXPORT_NAME_LEN: usize = 63;

pub fn export_name(
    context_id: &str,
    disk_index: i32,
    backup_type: &str,
    at: DateTime<Utc>,
) -> String {
    let timestamp = at.format("%Y%m%dT%H%M%S").to_string();
    let fixed = format!("backup--disk{}-{}-{}", disk_index, backup_type, timestamp);
    let budget = MAX_EXPORT_NAME_LEN.saturating_sub(fixed.len());

    let mut ctx = context_id;
    while ctx.len() > budget {
        // context ids are ASCII, but stay on char boundaries regardless
        let mut end = ctx.len() - 1;
        while !ctx.is_char_boundary(end) {
            end -= 1;
        }
        ctx = &ctx[..end];
    }

    format!(
        "backup-{}-disk{}-{}-{}",
        ctx, disk_index, backup_type, timestamp
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn canonical_form() {
        let name = export_name("ctx-ab12cd34ef56", 0, "full", at());
        assert_eq!(name, "backup-ctx-ab12cd34ef56-disk0-full-20250601T123045");
        assert!(name.len() <= MAX_EXPORT_NAME_LEN);
    }

    #[test]
    fn long_context_is_truncated_from_the_right() {
        let ctx = "ctx-".to_string() + &"a".repeat(80);
        let name = export_name(&ctx, 12, "incremental", at());
        assert!(name.len() <= MAX_EXPORT_NAME_LEN, "len = {}", name.len());
        assert!(name.starts_with("backup-ctx-aaa"));
        assert!(name.ends_with("-disk12-incremental-20250601T123045"));
    }

    #[test]
    fn truncation_is_exact_at_the_budget() {
        let ctx = "c".repeat(200);
        let name = export_name(&ctx, 0, "full", at());
        assert_eq!(name.len(), MAX_EXPORT_NAME_LEN);
    }
}
