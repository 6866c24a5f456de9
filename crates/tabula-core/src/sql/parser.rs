use crate::error::{Result, TabulaError};
use crate::store::Value;

/// Recursive-descent parser for the read-only SELECT dialect the query
/// pipeline accepts. Anything outside this grammar is rejected upstream.
///
/// SELECT items FROM table [WHERE expr] [GROUP BY cols]
/// [ORDER BY col [ASC|DESC]] [LIMIT n]

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    StringLit(String),
    Symbol(char),
    Op(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FuncArg {
    Star,
    Column(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    Column {
        name: String,
    },
    /// Function names are lowercased but otherwise unchecked here; the
    /// validator owns the whitelist.
    Function {
        name: String,
        arg: FuncArg,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Compare {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Like {
        column: String,
        pattern: String,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub items: Vec<SelectItem>,
    pub table: String,
    pub filter: Option<Expr>,
    pub group_by: Vec<String>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
}

impl SelectStatement {
    /// Every column name the statement references, for validation.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for item in &self.items {
            match item {
                SelectItem::Column { name } => out.push(name.as_str()),
                SelectItem::Function {
                    arg: FuncArg::Column(name),
                    ..
                } => out.push(name.as_str()),
                _ => {}
            }
        }
        if let Some(filter) = &self.filter {
            collect_expr_columns(filter, &mut out);
        }
        for g in &self.group_by {
            out.push(g.as_str());
        }
        if let Some(ob) = &self.order_by {
            out.push(ob.column.as_str());
        }
        out
    }

    pub fn has_aggregate(&self) -> bool {
        self.items.iter().any(|i| {
            matches!(
                i,
                SelectItem::Function { name, .. }
                    if matches!(name.as_str(), "count" | "sum" | "avg" | "min" | "max")
            )
        })
    }
}

fn collect_expr_columns<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Column(name) => out.push(name),
        Expr::Literal(_) => {}
        Expr::Compare { left, right, .. } => {
            collect_expr_columns(left, out);
            collect_expr_columns(right, out);
        }
        Expr::Like { column, .. } | Expr::IsNull { column, .. } => out.push(column),
        Expr::And(a, b) | Expr::Or(a, b) => {
            collect_expr_columns(a, out);
            collect_expr_columns(b, out);
        }
        Expr::Not(inner) => collect_expr_columns(inner, out),
    }
}

/// Split raw SQL on `;` while respecting string literals and quoted
/// identifiers. Empty statements are dropped.
pub fn split_statements(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    if chars.peek() == Some(&q) {
                        current.push(q);
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' => {
                    if !current.trim().is_empty() {
                        out.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(TabulaError::SqlParse(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::StringLit(s));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                s.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(TabulaError::SqlParse(
                                "unterminated quoted identifier".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Ident(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        s.push(d);
                        chars.next();
                    } else if d == '.' && !is_float {
                        is_float = true;
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let f = s
                        .parse::<f64>()
                        .map_err(|_| TabulaError::SqlParse(format!("bad number {s:?}")))?;
                    tokens.push(Token::Float(f));
                } else {
                    let i = s
                        .parse::<i64>()
                        .map_err(|_| TabulaError::SqlParse(format!("bad number {s:?}")))?;
                    tokens.push(Token::Int(i));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op("=".to_string()));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op("!=".to_string()));
                } else {
                    return Err(TabulaError::SqlParse("unexpected '!'".to_string()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op("<=".to_string()));
                } else if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Op("!=".to_string()));
                } else {
                    tokens.push(Token::Op("<".to_string()));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(">=".to_string()));
                } else {
                    tokens.push(Token::Op(">".to_string()));
                }
            }
            '(' | ')' | ',' | '*' | '-' => {
                chars.next();
                tokens.push(Token::Symbol(c));
            }
            other => {
                return Err(TabulaError::SqlParse(format!(
                    "unexpected character {other:?}"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(TabulaError::SqlParse(format!("expected {kw}")))
        }
    }

    fn eat_symbol(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Symbol(sym)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_symbol(&mut self, sym: char) -> Result<()> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(TabulaError::SqlParse(format!("expected {sym:?}")))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(TabulaError::SqlParse(format!(
                "expected identifier, got {other:?}"
            ))),
        }
    }

    fn parse_select(&mut self) -> Result<SelectStatement> {
        self.expect_keyword("select")?;

        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.eat_symbol(',') {
                break;
            }
        }

        self.expect_keyword("from")?;
        let table = self.expect_ident()?;

        let filter = if self.eat_keyword("where") {
            Some(self.parse_or()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword("group") {
            self.expect_keyword("by")?;
            loop {
                group_by.push(self.expect_ident()?);
                if !self.eat_symbol(',') {
                    break;
                }
            }
        }

        let order_by = if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            let column = self.expect_ident()?;
            let descending = if self.eat_keyword("desc") {
                true
            } else {
                self.eat_keyword("asc");
                false
            };
            Some(OrderBy { column, descending })
        } else {
            None
        };

        let limit = if self.eat_keyword("limit") {
            match self.next() {
                Some(Token::Int(n)) if n >= 0 => Some(n as u64),
                other => {
                    return Err(TabulaError::SqlParse(format!(
                        "expected limit count, got {other:?}"
                    )))
                }
            }
        } else {
            None
        };

        if let Some(tok) = self.peek() {
            return Err(TabulaError::SqlParse(format!(
                "unexpected trailing token {tok:?}"
            )));
        }

        Ok(SelectStatement {
            items,
            table,
            filter,
            group_by,
            order_by,
            limit,
        })
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.eat_symbol('*') {
            return Ok(SelectItem::Star);
        }
        let name = self.expect_ident()?;
        if self.eat_symbol('(') {
            let arg = if self.eat_symbol('*') {
                FuncArg::Star
            } else {
                FuncArg::Column(self.expect_ident()?)
            };
            self.expect_symbol(')')?;
            let alias = if self.eat_keyword("as") {
                Some(self.expect_ident()?)
            } else {
                None
            };
            return Ok(SelectItem::Function {
                name: name.to_ascii_lowercase(),
                arg,
                alias,
            });
        }
        Ok(SelectItem::Column { name })
    }

    // precedence: OR < AND < NOT < comparison
    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        if self.eat_symbol('(') {
            let inner = self.parse_or()?;
            self.expect_symbol(')')?;
            return Ok(inner);
        }

        let left = self.parse_operand()?;

        if let Expr::Column(column) = &left {
            if self.eat_keyword("is") {
                let negated = self.eat_keyword("not");
                self.expect_keyword("null")?;
                return Ok(Expr::IsNull {
                    column: column.clone(),
                    negated,
                });
            }
            let negated = {
                let save = self.pos;
                if self.eat_keyword("not") {
                    if matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case("like"))
                    {
                        true
                    } else {
                        self.pos = save;
                        false
                    }
                } else {
                    false
                }
            };
            if self.eat_keyword("like") {
                match self.next() {
                    Some(Token::StringLit(pattern)) => {
                        return Ok(Expr::Like {
                            column: column.clone(),
                            pattern,
                            negated,
                        })
                    }
                    other => {
                        return Err(TabulaError::SqlParse(format!(
                            "expected pattern string after LIKE, got {other:?}"
                        )))
                    }
                }
            }
        }

        match self.peek() {
            Some(Token::Op(op)) => {
                let op = op.clone();
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            _ => Err(TabulaError::SqlParse(
                "expected comparison operator".to_string(),
            )),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        let negative = self.eat_symbol('-');
        match self.next() {
            Some(Token::Ident(s)) => {
                if negative {
                    return Err(TabulaError::SqlParse("unexpected '-'".to_string()));
                }
                match s.to_ascii_lowercase().as_str() {
                    "true" => Ok(Expr::Literal(Value::Boolean(true))),
                    "false" => Ok(Expr::Literal(Value::Boolean(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    _ => Ok(Expr::Column(s)),
                }
            }
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Integer(if negative { -i } else { i }))),
            Some(Token::Float(f)) => {
                Ok(Expr::Literal(Value::Float(if negative { -f } else { f })))
            }
            Some(Token::StringLit(s)) => {
                if negative {
                    return Err(TabulaError::SqlParse("unexpected '-'".to_string()));
                }
                Ok(Expr::Literal(Value::Text(s)))
            }
            other => Err(TabulaError::SqlParse(format!(
                "expected operand, got {other:?}"
            ))),
        }
    }
}

/// Parse a single SELECT statement.
pub fn parse_select(input: &str) -> Result<SelectStatement> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(TabulaError::SqlParse("empty statement".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_select()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_star_select() {
        let stmt = parse_select("SELECT * FROM \"sales\" LIMIT 10").unwrap();
        assert_eq!(stmt.items, vec![SelectItem::Star]);
        assert_eq!(stmt.table, "sales");
        assert_eq!(stmt.limit, Some(10));
    }

    #[test]
    fn parses_columns_and_where() {
        let stmt = parse_select(
            "SELECT \"region\", \"amount\" FROM \"sales\" WHERE \"amount\" > 100 AND \"region\" = 'eu'",
        )
        .unwrap();
        assert_eq!(stmt.items.len(), 2);
        match stmt.filter.unwrap() {
            Expr::And(left, right) => {
                assert!(matches!(*left, Expr::Compare { .. }));
                assert!(matches!(*right, Expr::Compare { .. }));
            }
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn parses_aggregates_with_alias() {
        let stmt =
            parse_select("SELECT count(*) AS n, avg(\"amount\") FROM \"sales\" GROUP BY \"region\"")
                .unwrap();
        assert_eq!(
            stmt.items[0],
            SelectItem::Function {
                name: "count".to_string(),
                arg: FuncArg::Star,
                alias: Some("n".to_string()),
            }
        );
        assert!(stmt.has_aggregate());
        assert_eq!(stmt.group_by, vec!["region".to_string()]);
    }

    #[test]
    fn parses_order_and_like() {
        let stmt = parse_select(
            "SELECT * FROM t WHERE name LIKE '%smith%' ORDER BY name DESC LIMIT 5",
        )
        .unwrap();
        assert!(matches!(
            stmt.filter.unwrap(),
            Expr::Like { negated: false, .. }
        ));
        let ob = stmt.order_by.unwrap();
        assert_eq!(ob.column, "name");
        assert!(ob.descending);
    }

    #[test]
    fn parses_is_null_and_not() {
        let stmt =
            parse_select("SELECT * FROM t WHERE a IS NOT NULL AND NOT b = 1 LIMIT 10").unwrap();
        let Expr::And(left, right) = stmt.filter.unwrap() else {
            panic!("expected AND")
        };
        assert!(matches!(*left, Expr::IsNull { negated: true, .. }));
        assert!(matches!(*right, Expr::Not(_)));
    }

    #[test]
    fn rejects_non_select() {
        assert!(parse_select("DELETE FROM t").is_err());
        assert!(parse_select("DROP TABLE t").is_err());
        assert!(parse_select("").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_select("SELECT * FROM t LIMIT 5 whatever").is_err());
    }

    #[test]
    fn referenced_columns_cover_all_clauses() {
        let stmt = parse_select(
            "SELECT a, sum(b) FROM t WHERE c > 1 GROUP BY a ORDER BY d LIMIT 1",
        )
        .unwrap();
        let cols = stmt.referenced_columns();
        for name in ["a", "b", "c", "d"] {
            assert!(cols.contains(&name), "missing {name}");
        }
    }

    #[test]
    fn split_respects_string_literals() {
        let parts = split_statements("SELECT * FROM t WHERE a = 'x;y'; SELECT 1");
        assert_eq!(parts.len(), 2);
        assert!(parts[0].contains("x;y"));
        let single = split_statements("SELECT * FROM t;");
        assert_eq!(single.len(), 1);
    }
}
