use std::collections::VecDeque;
use std::time::Instant;

const RECENT_WINDOW: usize = 20;

/// Counters and timings for the trading engine, with a rolling window over
/// the most recent closed trades.
pub struct AgentMetrics {
    pub cycles_run: u64,
    pub monitor_ticks: u64,
    pub symbols_analyzed: u64,
    pub analysis_errors: u64,
    pub opinions_collected: u64,
    pub strategies_excluded: u64,
    pub consensus_directional: u64,
    pub risk_approved: u64,
    pub risk_rejected: u64,
    pub trades_executed: u64,
    pub trades_failed: u64,
    pub breaker_blocks: u64,
    pub total_pnl: f64,
    pub winning_trades: u64,
    pub losing_trades: u64,

    // Last cycle
    pub last_fetch_duration_ms: u64,
    pub last_analysis_duration_ms: u64,
    pub last_execution_duration_ms: u64,
    pub last_total_duration_ms: u64,
    pub last_tick_duration_ms: u64,

    recent_trades: VecDeque<ClosedTrade>,
    log_interval_cycles: u64,
}

struct ClosedTrade {
    pnl: f64,
    won: bool,
}

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            monitor_ticks: 0,
            symbols_analyzed: 0,
            analysis_errors: 0,
            opinions_collected: 0,
            strategies_excluded: 0,
            consensus_directional: 0,
            risk_approved: 0,
            risk_rejected: 0,
            trades_executed: 0,
            trades_failed: 0,
            breaker_blocks: 0,
            total_pnl: 0.0,
            winning_trades: 0,
            losing_trades: 0,
            last_fetch_duration_ms: 0,
            last_analysis_duration_ms: 0,
            last_execution_duration_ms: 0,
            last_total_duration_ms: 0,
            last_tick_duration_ms: 0,
            recent_trades: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn record_fetch_duration(&mut self, start: Instant) {
        self.last_fetch_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_analysis_duration(&mut self, start: Instant) {
        self.last_analysis_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_execution_duration(&mut self, start: Instant) {
        self.last_execution_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_tick(&mut self, start: Instant) {
        self.last_tick_duration_ms = start.elapsed().as_millis() as u64;
        self.monitor_ticks += 1;
    }

    pub fn record_trade_result(&mut self, pnl: f64) {
        let won = pnl > 0.0;
        self.total_pnl += pnl;
        if won {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }

        self.recent_trades.push_back(ClosedTrade { pnl, won });
        if self.recent_trades.len() > RECENT_WINDOW {
            self.recent_trades.pop_front();
        }
    }

    pub fn finish_cycle(&mut self, cycle_start: Instant) {
        self.last_total_duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.cycles_run += 1;

        if self.log_interval_cycles > 0 && self.cycles_run % self.log_interval_cycles == 0 {
            self.log_metrics();
        }
    }

    /// Win rate over the last 20 closed trades (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        let wins = self.recent_trades.iter().filter(|t| t.won).count() as f64;
        (wins / self.recent_trades.len() as f64) * 100.0
    }

    pub fn recent_avg_pnl(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        self.recent_trades.iter().map(|t| t.pnl).sum::<f64>() / self.recent_trades.len() as f64
    }

    pub fn overall_win_rate(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            return 0.0;
        }
        (self.winning_trades as f64 / total as f64) * 100.0
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            cycles = self.cycles_run,
            monitor_ticks = self.monitor_ticks,
            symbols_analyzed = self.symbols_analyzed,
            opinions = self.opinions_collected,
            strategies_excluded = self.strategies_excluded,
            consensus_directional = self.consensus_directional,
            risk_approved = self.risk_approved,
            risk_rejected = self.risk_rejected,
            trades_executed = self.trades_executed,
            trades_failed = self.trades_failed,
            breaker_blocks = self.breaker_blocks,
            total_pnl = format!("{:.2}", self.total_pnl),
            overall_win_rate = format!("{:.1}%", self.overall_win_rate()),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            recent_avg_pnl = format!("{:.2}", self.recent_avg_pnl()),
            last_cycle_ms = self.last_total_duration_ms,
            last_fetch_ms = self.last_fetch_duration_ms,
            last_analysis_ms = self.last_analysis_duration_ms,
            last_tick_ms = self.last_tick_duration_ms,
            "Engine metrics summary"
        );
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles_run": self.cycles_run,
            "monitor_ticks": self.monitor_ticks,
            "symbols_analyzed": self.symbols_analyzed,
            "analysis_errors": self.analysis_errors,
            "opinions_collected": self.opinions_collected,
            "strategies_excluded": self.strategies_excluded,
            "consensus_directional": self.consensus_directional,
            "risk_approved": self.risk_approved,
            "risk_rejected": self.risk_rejected,
            "trades_executed": self.trades_executed,
            "trades_failed": self.trades_failed,
            "breaker_blocks": self.breaker_blocks,
            "total_pnl": self.total_pnl,
            "winning_trades": self.winning_trades,
            "losing_trades": self.losing_trades,
        })
    }

    /// Restore counters from persisted JSON. Unknown or missing keys are left
    /// at their current value.
    pub fn restore_from_json(&mut self, json: &serde_json::Value) {
        let counters: [(&str, &mut u64); 14] = [
            ("cycles_run", &mut self.cycles_run),
            ("monitor_ticks", &mut self.monitor_ticks),
            ("symbols_analyzed", &mut self.symbols_analyzed),
            ("analysis_errors", &mut self.analysis_errors),
            ("opinions_collected", &mut self.opinions_collected),
            ("strategies_excluded", &mut self.strategies_excluded),
            ("consensus_directional", &mut self.consensus_directional),
            ("risk_approved", &mut self.risk_approved),
            ("risk_rejected", &mut self.risk_rejected),
            ("trades_executed", &mut self.trades_executed),
            ("trades_failed", &mut self.trades_failed),
            ("breaker_blocks", &mut self.breaker_blocks),
            ("winning_trades", &mut self.winning_trades),
            ("losing_trades", &mut self.losing_trades),
        ];
        for (key, slot) in counters {
            if let Some(v) = json.get(key).and_then(|v| v.as_u64()) {
                *slot = v;
            }
        }
        if let Some(v) = json.get("total_pnl").and_then(|v| v.as_f64()) {
            self.total_pnl = v;
        }
        tracing::info!(
            "Restored metrics from persisted state (cycles={})",
            self.cycles_run
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rolling_window_keeps_last_twenty() {
        let mut m = AgentMetrics::new(0);
        for _ in 0..10 {
            m.record_trade_result(-5.0);
        }
        for _ in 0..20 {
            m.record_trade_result(10.0);
        }
        assert_eq!(m.winning_trades, 20);
        assert_eq!(m.losing_trades, 10);
        assert_relative_eq!(m.recent_win_rate(), 100.0);
        assert_relative_eq!(m.recent_avg_pnl(), 10.0);
        assert_relative_eq!(m.overall_win_rate(), 200.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(m.total_pnl, 150.0);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let m = AgentMetrics::new(10);
        assert_eq!(m.recent_win_rate(), 0.0);
        assert_eq!(m.recent_avg_pnl(), 0.0);
        assert_eq!(m.overall_win_rate(), 0.0);
    }

    #[test]
    fn test_json_restore() {
        let mut m = AgentMetrics::new(0);
        m.cycles_run = 12;
        m.risk_rejected = 4;
        m.breaker_blocks = 2;
        m.record_trade_result(-3.5);

        let mut restored = AgentMetrics::new(0);
        restored.restore_from_json(&m.to_json());
        assert_eq!(restored.cycles_run, 12);
        assert_eq!(restored.risk_rejected, 4);
        assert_eq!(restored.breaker_blocks, 2);
        assert_eq!(restored.losing_trades, 1);
        assert_relative_eq!(restored.total_pnl, -3.5);
    }

    #[test]
    fn test_restore_ignores_missing_keys() {
        let mut m = AgentMetrics::new(0);
        m.trades_executed = 9;
        m.restore_from_json(&serde_json::json!({"cycles_run": 3}));
        assert_eq!(m.cycles_run, 3);
        assert_eq!(m.trades_executed, 9);
    }

    #[test]
    fn test_finish_cycle_counts() {
        let mut m = AgentMetrics::new(2);
        let start = AgentMetrics::start_timer();
        m.finish_cycle(start);
        m.finish_cycle(start);
        assert_eq!(m.cycles_run, 2);
    }
}
