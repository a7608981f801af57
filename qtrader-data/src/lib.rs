//! Market data provider contract and trading-calendar utilities.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use once_cell::sync::Lazy;
use qtrader_core::{Symbol, SymbolInfo, TickQuote};
use thiserror::Error;

/// Failure variants raised while constructing providers.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown data provider: {0}")]
    UnknownProvider(String),
    #[error("provider configuration is invalid: {0}")]
    InvalidConfig(String),
}

/// Inbound dependency supplying prices, the trading calendar, and symbol
/// metadata.
///
/// Every operation must be deterministic per input in backtest mode. A
/// `None` from [`DataProvider::current_price`] during trading means "no
/// quote this tick": affected orders are deferred, not rejected. A `None`
/// from [`DataProvider::symbol_info`] means the symbol is unknown for the
/// day and orders on it are rejected.
pub trait DataProvider: Send + Sync {
    /// Ordered trading days within `[start, end]`, possibly empty.
    fn trading_calendar(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate>;

    /// Price snapshot for `(symbol, dt)`.
    fn current_price(&self, symbol: &str, dt: NaiveDateTime) -> Option<TickQuote>;

    /// Static per-day information for a symbol.
    fn symbol_info(&self, symbol: &str, date: NaiveDate) -> Option<SymbolInfo>;
}

/// Factory contract used to construct data providers from configuration.
///
/// Applications register their providers here and select one by name, the
/// same way strategies are resolved.
pub trait ProviderFactory: Send + Sync {
    /// User-facing identifier (e.g. `"csv"`, `"mock"`).
    fn name(&self) -> &'static str;

    /// Build a provider instance from its TOML parameters.
    fn build(&self, params: toml::Value) -> Result<Arc<dyn DataProvider>, DataError>;
}

static PROVIDER_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn ProviderFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a provider factory under its canonical name.
pub fn register_provider_factory(factory: Arc<dyn ProviderFactory>) {
    let mut registry = PROVIDER_REGISTRY.write().expect("registry poisoned");
    registry.insert(factory.name().to_ascii_lowercase(), factory);
}

/// Build a registered provider by name.
pub fn load_provider(name: &str, params: toml::Value) -> Result<Arc<dyn DataProvider>, DataError> {
    let factory = {
        let registry = PROVIDER_REGISTRY.read().expect("registry poisoned");
        registry.get(&name.to_ascii_lowercase()).cloned()
    };
    factory
        .ok_or_else(|| DataError::UnknownProvider(name.to_string()))?
        .build(params)
}

/// Cached view of the provider's trading calendar.
///
/// The calendar is fetched once over a generous window and then served from
/// memory; the scheduler interrogates it on every simulation tick.
pub struct TradingCalendar {
    days: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    /// Fetch and cache the calendar covering at least `[start, end]`.
    pub fn load(provider: &dyn DataProvider, start: NaiveDate, end: NaiveDate) -> Self {
        // One extra year so simulation runs crossing year boundaries do not
        // have to refetch.
        let horizon = end + Duration::days(366);
        let days = provider
            .trading_calendar(start, horizon)
            .into_iter()
            .collect();
        Self { days }
    }

    /// Ordered trading days within `[start, end]`.
    #[must_use]
    pub fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        self.days
            .iter()
            .copied()
            .filter(|day| *day >= start && *day <= end)
            .collect()
    }

    #[must_use]
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.days.contains(&date)
    }
}

/// Deterministic in-memory provider used by tests and demos.
///
/// Quotes resolve from the most specific entry available: an exact
/// `(symbol, datetime)` override first, then the symbol's default quote for
/// the day.
#[derive(Default)]
pub struct FixtureProvider {
    calendar: Vec<NaiveDate>,
    day_quotes: HashMap<(Symbol, NaiveDate), TickQuote>,
    timed_quotes: HashMap<(Symbol, NaiveDate), BTreeMap<NaiveTime, TickQuote>>,
    names: HashMap<Symbol, String>,
    suspended: HashSet<(Symbol, NaiveDate)>,
    /// Days on which a symbol quotes nothing at all, overriding `day_quotes`.
    dark_days: HashSet<(Symbol, NaiveDate)>,
}

impl FixtureProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use every weekday in `[start, end]` as a trading day.
    #[must_use]
    pub fn with_weekday_calendar(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        let mut day = start;
        while day <= end {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                self.calendar.push(day);
            }
            day += Duration::days(1);
        }
        self
    }

    #[must_use]
    pub fn with_calendar(mut self, days: Vec<NaiveDate>) -> Self {
        self.calendar = days;
        self
    }

    /// Register a symbol name so `symbol_info` resolves it.
    #[must_use]
    pub fn with_symbol(mut self, symbol: &str, name: &str) -> Self {
        self.names.insert(symbol.to_string(), name.to_string());
        self
    }

    /// Default quote for the whole day.
    #[must_use]
    pub fn with_day_quote(mut self, symbol: &str, date: NaiveDate, quote: TickQuote) -> Self {
        self.day_quotes.insert((symbol.to_string(), date), quote);
        self
    }

    /// Quote override at an exact instant.
    #[must_use]
    pub fn with_quote_at(mut self, symbol: &str, dt: NaiveDateTime, quote: TickQuote) -> Self {
        self.timed_quotes
            .entry((symbol.to_string(), dt.date()))
            .or_default()
            .insert(dt.time(), quote);
        self
    }

    /// Mark a symbol suspended for one day.
    #[must_use]
    pub fn with_suspension(mut self, symbol: &str, date: NaiveDate) -> Self {
        self.suspended.insert((symbol.to_string(), date));
        self
    }

    /// Remove every quote for a symbol on one day.
    #[must_use]
    pub fn with_dark_day(mut self, symbol: &str, date: NaiveDate) -> Self {
        self.dark_days.insert((symbol.to_string(), date));
        self
    }
}

impl DataProvider for FixtureProvider {
    fn trading_calendar(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        self.calendar
            .iter()
            .copied()
            .filter(|day| *day >= start && *day <= end)
            .collect()
    }

    fn current_price(&self, symbol: &str, dt: NaiveDateTime) -> Option<TickQuote> {
        let key = (symbol.to_string(), dt.date());
        if self.dark_days.contains(&key) {
            return None;
        }
        if let Some(by_time) = self.timed_quotes.get(&key) {
            if let Some(quote) = by_time.get(&dt.time()) {
                return Some(quote.clone());
            }
        }
        self.day_quotes.get(&key).cloned()
    }

    fn symbol_info(&self, symbol: &str, date: NaiveDate) -> Option<SymbolInfo> {
        let name = self.names.get(symbol)?;
        Some(SymbolInfo {
            symbol_name: name.clone(),
            is_suspended: self.suspended.contains(&(symbol.to_string(), date)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekday_calendar_skips_weekends() {
        let provider = FixtureProvider::new()
            .with_weekday_calendar(date(2024, 3, 1), date(2024, 3, 10));
        let days = provider.trading_calendar(date(2024, 3, 1), date(2024, 3, 10));
        // 2024-03-02/03 and 2024-03-09/10 are weekends.
        assert_eq!(days.len(), 6);
        assert!(!days.contains(&date(2024, 3, 2)));
    }

    #[test]
    fn calendar_cache_filters_requested_range() {
        let provider = FixtureProvider::new()
            .with_weekday_calendar(date(2024, 1, 1), date(2024, 12, 31));
        let calendar = TradingCalendar::load(&provider, date(2024, 1, 1), date(2024, 1, 31));
        let days = calendar.trading_days(date(2024, 1, 8), date(2024, 1, 12));
        assert_eq!(days.first(), Some(&date(2024, 1, 8)));
        assert_eq!(days.last(), Some(&date(2024, 1, 12)));
        assert!(calendar.is_trading_day(date(2024, 1, 15)));
        assert!(!calendar.is_trading_day(date(2024, 1, 13)));
    }

    #[test]
    fn timed_quote_shadows_day_quote() {
        let day = date(2024, 3, 4);
        let provider = FixtureProvider::new()
            .with_day_quote("600519.SH", day, TickQuote::last(Decimal::from(10)))
            .with_quote_at(
                "600519.SH",
                day.and_hms_opt(10, 0, 0).unwrap(),
                TickQuote::last(Decimal::from(11)),
            );
        let at_ten = provider
            .current_price("600519.SH", day.and_hms_opt(10, 0, 0).unwrap())
            .unwrap();
        assert_eq!(at_ten.current_price, Decimal::from(11));
        let elsewhere = provider
            .current_price("600519.SH", day.and_hms_opt(14, 0, 0).unwrap())
            .unwrap();
        assert_eq!(elsewhere.current_price, Decimal::from(10));
    }

    #[test]
    fn dark_day_hides_all_quotes() {
        let day = date(2024, 3, 4);
        let provider = FixtureProvider::new()
            .with_day_quote("600519.SH", day, TickQuote::last(Decimal::from(10)))
            .with_dark_day("600519.SH", day);
        assert!(provider
            .current_price("600519.SH", day.and_hms_opt(10, 0, 0).unwrap())
            .is_none());
    }

    #[test]
    fn unknown_symbol_has_no_info() {
        let provider = FixtureProvider::new().with_symbol("600519.SH", "Kweichow Moutai");
        assert!(provider.symbol_info("000001.SZ", date(2024, 3, 4)).is_none());
        let info = provider.symbol_info("600519.SH", date(2024, 3, 4)).unwrap();
        assert!(!info.is_suspended);
    }
}
