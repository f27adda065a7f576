/// Drives `$work` with whatever `$work_rx.$op()` yields until the stop token is cancelled.
///
/// Usage: `loop_with_stop!("name", stop_rx, trigger.tick() => tick(it) on self as simple)`.
/// The surrounding function must return `anyhow::Result<()>`.
#[macro_export]
macro_rules! loop_with_stop {
    ($task_name:expr, $stop_rx:ident, $work_rx:ident.$op:ident() => $work:ident(it)$( on $self:ident)? as $result_type:ident) => {
        loop {
            let work_fut = $work_rx.$op();
            let stop_fut = $stop_rx.cancelled();

            tokio::select! {
                biased; // Stop should take prio
                _ = stop_fut => {
                    log::trace!("Cancellation signal received by {}.", $task_name);
                    return anyhow::Result::Ok(());
                }
                work_opt = work_fut => {
                    $crate::loop_with_stop!($result_type work_opt for $task_name, $work(it)$( on $self)?)
                }
            }
        }
    };

    (simple $result_simple:ident for $task_name:expr, $work:ident(it)$( on $self:ident)?) => {
        $($self.)?$work($result_simple).await?;
    }
}
