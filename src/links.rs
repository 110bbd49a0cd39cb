//! Link repair. `contradicts` and `related_to` are stored on both rows of a
//! pair; a crash or a partial write can leave one side behind. This walks a
//! scope and either restores the missing side or clears the dangling one.

use serde::Serialize;
use tracing::debug;

use crate::db::{MemoryDB, Status};
use crate::error::MemoryError;

const PAGE: usize = 500;
const CHANGED_BY: &str = "link_repair";

#[derive(Debug, Default, Clone, Serialize)]
pub struct LinkRepairReport {
    pub examined: usize,
    pub restored: usize,
    pub cleared: usize,
}

/// Repair every link held by rows owned by `(team, agent)`.
pub fn repair_links(
    db: &MemoryDB,
    team_id: &str,
    agent_id: Option<&str>,
) -> Result<LinkRepairReport, MemoryError> {
    let mut report = LinkRepairReport::default();
    let mut offset = 0;
    loop {
        let page = db.list_scope(team_id, agent_id, PAGE, offset)?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for row in page {
            if row.contradicts.is_empty() && row.related_to.is_empty() {
                continue;
            }
            report.examined += 1;
            repair_row(db, &row.id, &mut report)?;
        }
    }
    if report.restored + report.cleared > 0 {
        debug!(team_id, ?agent_id, restored = report.restored, cleared = report.cleared, "links repaired");
    }
    Ok(report)
}

/// Repair the links of the rows in `ids` only. Used right after a write.
pub fn repair_rows(db: &MemoryDB, ids: &[String]) -> Result<LinkRepairReport, MemoryError> {
    let mut report = LinkRepairReport::default();
    for id in ids {
        report.examined += 1;
        repair_row(db, id, &mut report)?;
    }
    Ok(report)
}

fn repair_row(db: &MemoryDB, id: &str, report: &mut LinkRepairReport) -> Result<(), MemoryError> {
    // reload: earlier repairs in this pass may have touched the row
    let Some(m) = db.get(id)? else {
        return Ok(());
    };

    let mut contradicts = Vec::with_capacity(m.contradicts.len());
    let mut to_dispute = Vec::new();
    for other_id in &m.contradicts {
        match db.get(other_id)? {
            Some(o) if m.status.is_retrievable() && o.status.is_retrievable() => {
                contradicts.push(other_id.clone());
                let symmetric = o.contradicts.iter().any(|x| x == &m.id)
                    && o.status == Status::Disputed
                    && m.status == Status::Disputed;
                if !symmetric {
                    to_dispute.push(other_id.clone());
                }
            }
            Some(o) => {
                // a retired row cannot be in dispute; drop the pair on both sides
                if o.contradicts.iter().any(|x| x == &m.id) {
                    let rest: Vec<String> =
                        o.contradicts.iter().filter(|x| *x != &m.id).cloned().collect();
                    db.set_links(&o.id, rest, o.related_to.clone(), CHANGED_BY, "retired dispute partner")?;
                }
                report.cleared += 1;
            }
            None => report.cleared += 1,
        }
    }

    let mut related = Vec::with_capacity(m.related_to.len());
    let mut to_link = Vec::new();
    for other_id in &m.related_to {
        match db.get(other_id)? {
            Some(o) => {
                related.push(other_id.clone());
                if !o.related_to.iter().any(|x| x == &m.id) {
                    to_link.push(other_id.clone());
                }
            }
            None => report.cleared += 1,
        }
    }

    if contradicts != m.contradicts || related != m.related_to {
        db.set_links(&m.id, contradicts, related, CHANGED_BY, "dangling link cleared")?;
    }
    for other in to_link {
        db.link_related(&m.id, &other, CHANGED_BY, "missing back-link restored")?;
        report.restored += 1;
    }
    for other in to_dispute {
        db.mark_disputed(&m.id, &other, CHANGED_BY, "one-sided contradiction restored")?;
        report.restored += 1;
    }
    Ok(())
}
