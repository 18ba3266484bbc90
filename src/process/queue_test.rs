#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::process::queue::{Command, CommandQueue, QueueAction};

    #[test]
    fn test_first_enqueue_before_connect_asks_to_connect() {
        let mut queue = CommandQueue::new();
        assert_eq!(queue.enqueue("pause\n"), QueueAction::Connect);
        assert_eq!(queue.in_flight(), Some(&Command::Connect));
        // Further commands pile up behind the connect.
        assert_eq!(queue.enqueue("quit\n"), QueueAction::None);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_connect_drains_first_queued_line() {
        let mut queue = CommandQueue::new();
        queue.enqueue("pause\n");
        queue.enqueue("quit\n");
        assert_eq!(
            queue.on_connected(),
            QueueAction::Write("pause\n".to_string())
        );
        assert_eq!(queue.in_flight(), Some(&Command::Line("pause\n".to_string())));
    }

    #[test]
    fn test_one_in_flight_fifo_order() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a\n");
        queue.on_connected();
        assert_eq!(queue.enqueue("b\n"), QueueAction::None);
        assert_eq!(queue.enqueue("c\n"), QueueAction::None);
        assert_eq!(queue.on_write_complete(), QueueAction::Write("b\n".to_string()));
        assert_eq!(queue.on_write_complete(), QueueAction::Write("c\n".to_string()));
        assert_eq!(queue.on_write_complete(), QueueAction::None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_while_idle_and_connected_writes_immediately() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a\n");
        queue.on_connected();
        queue.on_write_complete();
        assert_eq!(queue.enqueue("b\n"), QueueAction::Write("b\n".to_string()));
    }

    #[test]
    fn test_process_exit_discards_everything() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a\n");
        queue.on_connected();
        queue.enqueue("b\n");
        queue.on_process_exit();
        assert!(queue.is_empty());
        assert!(!queue.is_connected());
        // A new session starts with a fresh connect.
        assert_eq!(queue.enqueue("c\n"), QueueAction::Connect);
    }

    #[test]
    fn test_connect_failure_discards_everything() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a\n");
        queue.enqueue("b\n");
        queue.on_connect_failed();
        assert!(queue.is_empty());
        assert!(!queue.is_connected());
    }

    #[test]
    fn test_watchdog_drops_queued_but_keeps_in_flight() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a\n");
        queue.on_connected();
        queue.enqueue_with_timeout("seek 10 1\n", Duration::from_secs(1));
        assert_eq!(queue.watchdog(), Some(Duration::from_secs(1)));
        queue.on_watchdog_fired();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(), Some(&Command::Line("a\n".to_string())));
        assert_eq!(queue.watchdog(), None);
        // The stalled write can still complete later.
        assert_eq!(queue.on_write_complete(), QueueAction::None);
    }

    #[test]
    fn test_remove_queued_takes_first_match_only() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a\n");
        queue.on_connected();
        queue.enqueue("seek 10 1\n");
        queue.enqueue("pause\n");
        queue.enqueue("seek 20 1\n");
        assert!(queue.remove_queued("seek "));
        assert_eq!(queue.len(), 2);
        // The in-flight command is never touched.
        queue.on_write_complete();
        assert_eq!(queue.on_write_complete(), QueueAction::Write("seek 20 1\n".to_string()));
        assert!(!queue.remove_queued("seek "));
    }
}
