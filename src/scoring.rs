//! Category and overall scores
//!
//! A category scores `round(100 * (passed + warnings / 2) / total)`. The
//! overall score is a weighted sum of the five categories. Both are computed
//! in integer hundredths so half values always round up.

use crate::{AuditBlock, AuditScores, Categories, CategoryResult, CertificateBlock, ScoringSettings};

/// Category weights in percent: commonSeo, speed, security, mobile, advancedSeo
pub const CATEGORY_WEIGHTS: [u32; 5] = [30, 30, 15, 15, 10];

pub fn category_score(category: &CategoryResult, empty_score: u8) -> u8 {
    let total = category.total() as u64;
    if total == 0 {
        return empty_score;
    }

    let numerator = 200 * category.passed.len() as u64 + 100 * category.warnings.len() as u64;
    let denominator = 2 * total;
    ((numerator + denominator / 2) / denominator) as u8
}

/// Weighted overall score from category scores in report order.
pub fn overall_score(scores: [u8; 5]) -> u8 {
    let weighted: u32 = scores
        .iter()
        .zip(CATEGORY_WEIGHTS)
        .map(|(score, weight)| u32::from(*score) * weight)
        .sum();
    ((weighted + 50) / 100) as u8
}

/// Audit results can raise the speed and common SEO scores, never lower them.
pub fn apply_audit_scores(categories: &mut Categories, audit: &AuditScores) {
    categories.speed.score = categories.speed.score.max(audit.performance);
    categories.common_seo.score = categories.common_seo.score.max(audit.seo);
}

/// Fill in every category score and return the overall score.
pub fn score_report(
    categories: &mut Categories,
    audit: Option<&AuditScores>,
    settings: &ScoringSettings,
) -> u8 {
    let empty = settings.empty_category_score;
    for category in [
        &mut categories.common_seo,
        &mut categories.speed,
        &mut categories.security,
        &mut categories.mobile,
        &mut categories.advanced_seo,
    ] {
        category.score = category_score(category, empty);
    }

    if let Some(audit) = audit {
        apply_audit_scores(categories, audit);
    }

    overall_score([
        categories.common_seo.score,
        categories.speed.score,
        categories.security.score,
        categories.mobile.score,
        categories.advanced_seo.score,
    ])
}

/// Turn the audit outcome into a speed finding.
pub fn add_audit_findings(categories: &mut Categories, audit: &AuditBlock) {
    let speed = &mut categories.speed;
    match audit {
        AuditBlock::Completed(scores) => {
            let finding = format!("Lighthouse performance score: {}", scores.performance);
            match scores.performance {
                90.. => speed.pass(finding),
                50..=89 => speed.warn(finding),
                _ => speed.fail(finding),
            }
        }
        AuditBlock::Failed { error, timed_out } => {
            if *timed_out {
                speed.warn("Lighthouse audit timed out, performance could not be measured");
            } else {
                speed.warn(format!("Lighthouse audit unavailable: {error}"));
            }
        }
    }
}

/// Turn the certificate probe outcome into security findings.
pub fn add_certificate_findings(categories: &mut Categories, certificate: &CertificateBlock) {
    let security = &mut categories.security;
    match certificate {
        CertificateBlock::Info(info) if info.is_expired => {
            security.fail(format!("SSL certificate expired on {}", info.valid_to));
        }
        CertificateBlock::Info(info) if !info.authorized => {
            security.warn(format!(
                "SSL certificate is not trusted by the system root store ({} days remaining)",
                info.days_remaining
            ));
        }
        CertificateBlock::Info(info) => {
            security.pass(format!(
                "Valid SSL certificate ({} days remaining)",
                info.days_remaining
            ));
        }
        CertificateBlock::Failed { timed_out: true, .. } => {
            security.warn("SSL certificate check timed out");
        }
        CertificateBlock::Failed { error, .. } => {
            security.warn(format!("SSL certificate could not be checked: {error}"));
        }
    }
}
