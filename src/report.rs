//! Console report and CSV export adapters for backtest results.

use std::path::Path;

use anyhow::{Context, Result};

use crate::backtest::config::BacktestResult;
use crate::backtest::metrics::TradeRecord;

/// Print a formatted result block to stdout.
pub fn print_summary(result: &BacktestResult) {
    let ruler = "=".repeat(70);
    println!("{ruler}");
    println!("Backtest Results: {}", result.strategy_name);
    println!("{ruler}");
    println!();
    println!("Performance:");
    println!("  Final Equity:       ${:.2}", result.final_equity);
    println!("  Total Return:       {:+.2}%", result.total_return * 100.0);
    println!("  Annualized Return:  {:+.2}%", result.annualized_return_pct);
    println!("  Max Drawdown:       {:.2}%", result.max_drawdown * 100.0);
    println!("  Sharpe Ratio:       {:.3}", result.sharpe_ratio);
    println!("  Sortino Ratio:      {:.3}", result.sortino_ratio);
    println!();
    println!("Trading Statistics:");
    println!("  Total Trades:       {}", result.num_trades);
    println!("  Winning Trades:     {}", result.num_winning_trades);
    println!("  Losing Trades:      {}", result.num_losing_trades);
    println!("  Win Rate:           {:.2}%", result.win_rate * 100.0);
    if result.profit_factor.is_finite() {
        println!("  Profit Factor:      {:.3}", result.profit_factor);
    } else {
        println!("  Profit Factor:      inf");
    }
    println!("  Expectancy:         ${:.4}", result.expectancy);
    println!("  Average Win:        ${:.2}", result.avg_win);
    println!("  Average Loss:       ${:.2}", result.avg_loss);
    println!("  Total Fees Paid:    ${:.2}", result.total_fees_paid);
    println!("  Fees % of Volume:   {:.4}%", result.fees_pct_of_volume);
    println!();
    println!("  Events Processed:   {}", result.events_processed);
    println!("{ruler}");
}

/// Write the paired trade log as CSV.
pub fn export_trades_csv(trades: &[TradeRecord], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record([
        "asset_id",
        "side",
        "entry_price",
        "exit_price",
        "quantity",
        "entry_time_ms",
        "exit_time_ms",
        "realized_pnl",
        "fees",
        "is_winner",
    ])?;
    for trade in trades {
        writer.write_record([
            trade.asset_id.as_str(),
            trade.side.as_str(),
            &trade.entry_price.to_string(),
            &trade.exit_price.to_string(),
            &trade.quantity.to_string(),
            &trade.entry_time_ms.to_string(),
            &trade.exit_time_ms.to_string(),
            &trade.realized_pnl.to_string(),
            &trade.fees.to_string(),
            if trade.is_winner { "true" } else { "false" },
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the equity curve as CSV.
pub fn export_equity_csv(equity_curve: &[(i64, f64)], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["timestamp_ms", "equity"])?;
    for (timestamp_ms, equity) in equity_curve {
        writer.write_record([timestamp_ms.to_string(), equity.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}
