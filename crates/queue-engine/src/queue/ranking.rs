//! Ranking of waiting tickets into a strict total order.
//!
//! Primary key: priority tier (vip before normal). Secondary key: check-in
//! time, oldest first. Tickets with identical timestamps fall back to the
//! ticket id, so any two calls over the same snapshot produce the same
//! sequence.

use std::cmp::Ordering;

use crate::ticket::{Ticket, TicketId};

/// Sort waiting tickets in place into calling order
pub fn rank_waiting(tickets: &mut [Ticket]) {
    tickets.sort_by(compare);
}

/// Total order used for every queue decision
pub fn compare(a: &Ticket, b: &Ticket) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.0.cmp(&b.id.0))
}

/// 1-based position of a ticket within an already ranked snapshot
pub fn position_of(ranked: &[Ticket], id: &TicketId) -> Option<usize> {
    ranked.iter().position(|t| &t.id == id).map(|i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::branch::{BranchId, ServiceId};
    use crate::ticket::{CheckinRequest, Ticket, TicketId, TicketPriority};

    fn ticket(id: &str, priority: TicketPriority, offset_secs: i64) -> Ticket {
        let base = Utc::now();
        let req = CheckinRequest {
            priority,
            ..CheckinRequest::kiosk(BranchId::from("b1"), ServiceId::from("s1"))
        };
        let mut t = Ticket::new(&req, format!("A-{:03}", offset_secs), base);
        t.id = TicketId::from(id);
        t.created_at = base + Duration::seconds(offset_secs);
        t
    }

    #[test]
    fn vip_ranks_before_earlier_normal() {
        // A(vip, t=0), B(normal, t=1), C(normal, t=2) -> [A, B, C]
        let mut tickets = vec![
            ticket("c", TicketPriority::Normal, 2),
            ticket("a", TicketPriority::Vip, 0),
            ticket("b", TicketPriority::Normal, 1),
        ];
        rank_waiting(&mut tickets);
        let ids: Vec<&str> = tickets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert_eq!(position_of(&tickets, &TicketId::from("a")), Some(1));
        assert_eq!(position_of(&tickets, &TicketId::from("b")), Some(2));
        assert_eq!(position_of(&tickets, &TicketId::from("c")), Some(3));
    }

    #[test]
    fn late_vip_still_beats_all_normals() {
        let mut tickets = vec![
            ticket("n1", TicketPriority::Normal, 0),
            ticket("n2", TicketPriority::Normal, 10),
            ticket("v", TicketPriority::Vip, 3600),
        ];
        rank_waiting(&mut tickets);
        assert_eq!(tickets[0].id.as_str(), "v");
    }

    #[test]
    fn identical_timestamps_break_ties_by_id() {
        let mut tickets = vec![
            ticket("z", TicketPriority::Normal, 5),
            ticket("a", TicketPriority::Normal, 5),
            ticket("m", TicketPriority::Normal, 5),
        ];
        rank_waiting(&mut tickets);
        let ids: Vec<&str> = tickets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }

    #[test]
    fn ranking_is_deterministic_across_shuffles() {
        let base = vec![
            ticket("a", TicketPriority::Vip, 7),
            ticket("b", TicketPriority::Normal, 1),
            ticket("c", TicketPriority::Normal, 1),
            ticket("d", TicketPriority::Vip, 2),
            ticket("e", TicketPriority::Normal, 9),
        ];

        let mut first = base.clone();
        rank_waiting(&mut first);
        let reference: Vec<&str> = first.iter().map(|t| t.id.as_str()).collect();

        // Any starting permutation converges to the same sequence
        for rotation in 1..base.len() {
            let mut shuffled = base.clone();
            shuffled.rotate_left(rotation);
            rank_waiting(&mut shuffled);
            let ids: Vec<&str> = shuffled.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(ids, reference);
        }
    }

    #[test]
    fn order_is_transitive() {
        let tickets = vec![
            ticket("a", TicketPriority::Vip, 0),
            ticket("b", TicketPriority::Normal, 0),
            ticket("c", TicketPriority::Normal, 60),
        ];
        for x in &tickets {
            for y in &tickets {
                for z in &tickets {
                    if compare(x, y) == std::cmp::Ordering::Less
                        && compare(y, z) == std::cmp::Ordering::Less
                    {
                        assert_eq!(compare(x, z), std::cmp::Ordering::Less);
                    }
                }
            }
        }
    }
}
