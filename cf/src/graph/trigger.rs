//! Graph-string grammar
//!
//! Parses lines of the dependency graph into chains of boolean expressions
//! over task nodes. A node is `[!]name[<param>][\[offset\]][:output]`; nodes
//! combine with `&`, `|` and parentheses; `=>` chains expression groups into
//! edges.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::multispace0,
    combinator::opt,
    multi::separated_list1,
    sequence::{delimited, preceded},
    IResult,
};

use crate::cycling::{CycleDuration, CycleError};

/// One parsed node reference in a graph line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Suicide marker (`!name`); only meaningful in target position
    pub suicide: bool,
    /// Xtrigger reference (`@name`); only meaningful as a trigger conjunct
    pub xtrigger: bool,
    /// Task, family, or parameterised name (`model<i>`)
    pub name: String,
    /// Inter-cycle offset, e.g. `[-P1D]`
    pub offset: Option<CycleDuration>,
    /// Output qualifier, e.g. `:succeeded`, `:succeed-all`; None = succeeded
    pub output: Option<String>,
}

/// A boolean expression over graph nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphExpr {
    Node(GraphNode),
    All(Vec<GraphExpr>),
    Any(Vec<GraphExpr>),
}

impl GraphExpr {
    /// Iterate every node in the expression
    pub fn nodes(&self) -> Vec<&GraphNode> {
        let mut out = Vec::new();
        self.collect_nodes(&mut out);
        out
    }

    fn collect_nodes<'a>(&'a self, out: &mut Vec<&'a GraphNode>) {
        match self {
            Self::Node(n) => out.push(n),
            Self::All(xs) | Self::Any(xs) => {
                for x in xs {
                    x.collect_nodes(out);
                }
            }
        }
    }

    /// Rebuild the expression with every node mapped through `f`; a node may
    /// expand to a sub-expression (family/parameter expansion).
    pub fn map_nodes<F>(&self, f: &F) -> GraphExpr
    where
        F: Fn(&GraphNode) -> GraphExpr,
    {
        match self {
            Self::Node(n) => f(n),
            Self::All(xs) => Self::All(xs.iter().map(|x| x.map_nodes(f)).collect()),
            Self::Any(xs) => Self::Any(xs.iter().map(|x| x.map_nodes(f)).collect()),
        }
    }
}

/// A graph line parsed into `=>`-separated expression groups
pub type GraphChain = Vec<GraphExpr>;

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')(input)
}

fn param_part(input: &str) -> IResult<&str, &str> {
    delimited(tag("<"), take_while1(|c| c != '>'), tag(">"))(input)
}

fn offset_part(input: &str) -> IResult<&str, &str> {
    delimited(tag("["), take_while1(|c| c != ']'), tag("]"))(input)
}

fn node(input: &str) -> IResult<&str, GraphNode> {
    let (input, _) = multispace0(input)?;
    let (input, bang) = opt(tag("!"))(input)?;
    let (input, at) = opt(tag("@"))(input)?;
    let (input, name) = ident(input)?;
    let (input, param) = opt(param_part)(input)?;
    let (input, offset) = opt(offset_part)(input)?;
    let (input, output) = opt(preceded(tag(":"), ident))(input)?;

    let full_name = match param {
        Some(p) => format!("{}<{}>", name, p),
        None => name.to_string(),
    };
    let offset = match offset {
        Some(text) => match CycleDuration::parse(text) {
            Ok(d) => Some(d),
            Err(_) => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::MapRes,
                )))
            }
        },
        None => None,
    };

    Ok((
        input,
        GraphNode {
            suicide: bang.is_some(),
            xtrigger: at.is_some(),
            name: full_name,
            offset,
            output: output.map(str::to_string),
        },
    ))
}

fn atom(input: &str) -> IResult<&str, GraphExpr> {
    let (input, _) = multispace0(input)?;
    alt((
        delimited(
            preceded(multispace0, tag("(")),
            or_expr,
            preceded(multispace0, tag(")")),
        ),
        |i| node(i).map(|(rest, n)| (rest, GraphExpr::Node(n))),
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, GraphExpr> {
    let (input, parts) = separated_list1(preceded(multispace0, tag("&")), atom)(input)?;
    Ok((
        input,
        if parts.len() == 1 {
            parts.into_iter().next().expect("non-empty")
        } else {
            GraphExpr::All(parts)
        },
    ))
}

fn or_expr(input: &str) -> IResult<&str, GraphExpr> {
    let (input, parts) = separated_list1(preceded(multispace0, tag("|")), and_expr)(input)?;
    Ok((
        input,
        if parts.len() == 1 {
            parts.into_iter().next().expect("non-empty")
        } else {
            GraphExpr::Any(parts)
        },
    ))
}

fn chain(input: &str) -> IResult<&str, GraphChain> {
    separated_list1(preceded(multispace0, tag("=>")), or_expr)(input)
}

/// Parse one graph line into its expression chain
pub fn parse_line(line: &str) -> Result<GraphChain, CycleError> {
    let (rest, groups) =
        chain(line).map_err(|_| CycleError::ParseRecurrence(format!("bad graph line: {}", line)))?;
    if !rest.trim().is_empty() {
        return Err(CycleError::ParseRecurrence(format!(
            "trailing input {:?} in graph line: {}",
            rest.trim(),
            line
        )));
    }
    Ok(groups)
}

/// Split a graph string into logical lines: comments stripped, `=>`
/// continuations joined, blanks dropped.
pub fn logical_lines(graph: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in graph.lines() {
        let line = match raw.split_once('#') {
            Some((before, _)) => before,
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let continuation = lines
            .last()
            .map(|prev: &String| prev.ends_with("=>") || prev.ends_with('&') || prev.ends_with('|'))
            .unwrap_or(false)
            || line.starts_with("=>")
            || line.starts_with('&')
            || line.starts_with('|');
        if continuation && !lines.is_empty() {
            let prev = lines.last_mut().expect("non-empty");
            prev.push(' ');
            prev.push_str(line);
        } else {
            lines.push(line.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(name: &str) -> GraphExpr {
        GraphExpr::Node(GraphNode {
            suicide: false,
            xtrigger: false,
            name: name.to_string(),
            offset: None,
            output: None,
        })
    }

    #[test]
    fn test_simple_chain() {
        let chain = parse_line("a => b => c").unwrap();
        assert_eq!(chain, vec![n("a"), n("b"), n("c")]);
    }

    #[test]
    fn test_and_or_precedence() {
        // & binds tighter than |
        let chain = parse_line("a & b | c => d").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], GraphExpr::Any(vec![GraphExpr::All(vec![n("a"), n("b")]), n("c")]));
    }

    #[test]
    fn test_parens() {
        let chain = parse_line("a & (b | c) => d").unwrap();
        assert_eq!(
            chain[0],
            GraphExpr::All(vec![n("a"), GraphExpr::Any(vec![n("b"), n("c")])])
        );
    }

    #[test]
    fn test_offset_and_output() {
        let chain = parse_line("b[-P1D]:failed => recover").unwrap();
        let GraphExpr::Node(node) = &chain[0] else { panic!("expected node") };
        assert_eq!(node.name, "b");
        assert_eq!(node.offset, Some(CycleDuration::parse("-P1D").unwrap()));
        assert_eq!(node.output.as_deref(), Some("failed"));
    }

    #[test]
    fn test_integer_offset() {
        let chain = parse_line("b[-P1] => b").unwrap();
        let GraphExpr::Node(node) = &chain[0] else { panic!("expected node") };
        assert_eq!(node.offset, Some(CycleDuration::Integer(-1)));
    }

    #[test]
    fn test_suicide_target() {
        let chain = parse_line("x:failed => !x").unwrap();
        let GraphExpr::Node(node) = &chain[1] else { panic!("expected node") };
        assert!(node.suicide);
        assert_eq!(node.name, "x");
    }

    #[test]
    fn test_family_qualifier() {
        let chain = parse_line("FAM:succeed-all => next").unwrap();
        let GraphExpr::Node(node) = &chain[0] else { panic!("expected node") };
        assert_eq!(node.output.as_deref(), Some("succeed-all"));
    }

    #[test]
    fn test_xtrigger_node() {
        let chain = parse_line("@check_data & a => b").unwrap();
        let GraphExpr::All(parts) = &chain[0] else { panic!("expected All") };
        let GraphExpr::Node(node) = &parts[0] else { panic!("expected node") };
        assert!(node.xtrigger);
        assert_eq!(node.name, "check_data");
    }

    #[test]
    fn test_parameterised_name() {
        let chain = parse_line("model<i> => post<i>").unwrap();
        let GraphExpr::Node(node) = &chain[0] else { panic!("expected node") };
        assert_eq!(node.name, "model<i>");
    }

    #[test]
    fn test_bad_lines_rejected() {
        for bad in ["", "=>", "a =>", "a => => b", "a &", "a )", "a [P1"] {
            assert!(parse_line(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_logical_lines() {
        let graph = "
            a => b # comment
            b => c &
                 d
            e =>
              f
        ";
        let lines = logical_lines(graph);
        assert_eq!(lines, vec!["a => b", "b => c & d", "e => f"]);
    }
}
