//! Introspection XML: spec §4.J. Parses the `org.freedesktop.DBus.Introspectable.Introspect`
//! reply into a query-able `{node, interface, method, signal, arg}` tree,
//! the way `tokio-dbus-xml`'s parser builds its own element tree, but
//! trimmed to what this crate's [`crate::proxy::Proxy::introspect`] needs:
//! no `<doc>`/`<annotation>` elements, no per-element source spans.

use xmlparser::{ElementEnd, Token};

use crate::error::{Error, ErrorKind, Result};
use crate::signature::Signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub ty: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Method {
    /// The concatenated signature of this method's `in` arguments, the
    /// order a caller must supply them in the call's body.
    pub fn in_signature(&self) -> Result<Signature> {
        concat_signature(self.args.iter().filter(|a| a.direction == Direction::In))
    }

    /// The concatenated signature of this method's `out` arguments, the
    /// order a `MethodReturn`'s body carries them in.
    pub fn out_signature(&self) -> Result<Signature> {
        concat_signature(self.args.iter().filter(|a| a.direction == Direction::Out))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Signal {
    pub fn signature(&self) -> Result<Signature> {
        concat_signature(self.args.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Method>,
    pub signals: Vec<Signal>,
}

impl Interface {
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub name: Option<String>,
    pub interfaces: Vec<Interface>,
    pub nodes: Vec<Node>,
}

impl Node {
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

fn concat_signature<'a>(args: impl Iterator<Item = &'a Arg>) -> Result<Signature> {
    let mut sig = Signature::empty();
    for arg in args {
        sig.push_signature(&Signature::new(arg.ty.clone())?);
    }
    Ok(sig)
}

#[derive(Default)]
struct NodeBuilder {
    name: Option<String>,
    interfaces: Vec<Interface>,
    nodes: Vec<Node>,
}

impl NodeBuilder {
    fn build(self) -> Node {
        Node {
            name: self.name,
            interfaces: self.interfaces,
            nodes: self.nodes,
        }
    }
}

#[derive(Default)]
struct InterfaceBuilder {
    name: Option<String>,
    methods: Vec<Method>,
    signals: Vec<Signal>,
}

impl InterfaceBuilder {
    fn build(self) -> Result<Interface> {
        Ok(Interface {
            name: self.name.ok_or_else(|| Error::new(ErrorKind::InvalidIntrospectionXml("interface missing name".to_string())))?,
            methods: self.methods,
            signals: self.signals,
        })
    }
}

#[derive(Default)]
struct MethodBuilder {
    name: Option<String>,
    args: Vec<Arg>,
}

impl MethodBuilder {
    fn build(self) -> Result<Method> {
        Ok(Method {
            name: self.name.ok_or_else(|| Error::new(ErrorKind::InvalidIntrospectionXml("method missing name".to_string())))?,
            args: self.args,
        })
    }
}

#[derive(Default)]
struct SignalBuilder {
    name: Option<String>,
    args: Vec<Arg>,
}

impl SignalBuilder {
    fn build(self) -> Result<Signal> {
        Ok(Signal {
            name: self.name.ok_or_else(|| Error::new(ErrorKind::InvalidIntrospectionXml("signal missing name".to_string())))?,
            args: self.args,
        })
    }
}

#[derive(Default)]
struct ArgBuilder {
    name: Option<String>,
    ty: Option<String>,
    // `<arg>` omits `direction` for signal arguments, which default to "out".
    direction: Option<Direction>,
}

impl ArgBuilder {
    fn build(self, default_direction: Direction) -> Result<Arg> {
        Ok(Arg {
            name: self.name,
            ty: self.ty.ok_or_else(|| Error::new(ErrorKind::InvalidIntrospectionXml("arg missing type".to_string())))?,
            direction: self.direction.unwrap_or(default_direction),
        })
    }
}

enum State {
    Node(NodeBuilder),
    Interface(InterfaceBuilder),
    Method(MethodBuilder),
    Signal(SignalBuilder),
    Arg(ArgBuilder),
    /// `<annotation>`, `<doc>`, and anything else this crate doesn't query.
    Ignored,
}

/// Parse an `Introspect` reply's XML body into a [`Node`] tree.
pub fn parse(xml: &str) -> Result<Node> {
    let mut stack: Vec<State> = Vec::new();
    let mut root = NodeBuilder::default();

    for token in xmlparser::Tokenizer::from(xml) {
        let token = token.map_err(|_| Error::new(ErrorKind::InvalidIntrospectionXml("malformed xml".to_string())))?;

        match token {
            Token::ElementStart { local, .. } => match (stack.last(), local.as_str()) {
                (None, "node") => stack.push(State::Node(NodeBuilder::default())),
                (Some(State::Node(_)), "interface") => stack.push(State::Interface(InterfaceBuilder::default())),
                (Some(State::Node(_)), "node") => stack.push(State::Node(NodeBuilder::default())),
                (Some(State::Interface(_)), "method") => stack.push(State::Method(MethodBuilder::default())),
                (Some(State::Interface(_)), "signal") => stack.push(State::Signal(SignalBuilder::default())),
                (Some(State::Method(_) | State::Signal(_)), "arg") => stack.push(State::Arg(ArgBuilder::default())),
                _ => stack.push(State::Ignored),
            },
            Token::ElementEnd { end, .. } => {
                if matches!(end, ElementEnd::Open) {
                    continue;
                }
                let Some(top) = stack.pop() else {
                    continue;
                };
                match (stack.last_mut(), top) {
                    (None, State::Node(builder)) => root = builder,
                    (Some(State::Node(parent)), State::Node(builder)) => parent.nodes.push(builder.build()),
                    (Some(State::Node(parent)), State::Interface(builder)) => {
                        parent.interfaces.push(builder.build()?)
                    }
                    (Some(State::Interface(parent)), State::Method(builder)) => {
                        parent.methods.push(builder.build()?)
                    }
                    (Some(State::Interface(parent)), State::Signal(builder)) => {
                        parent.signals.push(builder.build()?)
                    }
                    (Some(State::Method(parent)), State::Arg(builder)) => {
                        parent.args.push(builder.build(Direction::In)?)
                    }
                    (Some(State::Signal(parent)), State::Arg(builder)) => {
                        parent.args.push(builder.build(Direction::Out)?)
                    }
                    (_, State::Ignored) => {}
                    _ => {}
                }
            }
            Token::Attribute { local, value, .. } => match (stack.last_mut(), local.as_str()) {
                (Some(State::Node(builder)), "name") => builder.name = Some(value.as_str().to_owned()),
                (Some(State::Interface(builder)), "name") => builder.name = Some(value.as_str().to_owned()),
                (Some(State::Method(builder)), "name") => builder.name = Some(value.as_str().to_owned()),
                (Some(State::Signal(builder)), "name") => builder.name = Some(value.as_str().to_owned()),
                (Some(State::Arg(builder)), "name") => builder.name = Some(value.as_str().to_owned()),
                (Some(State::Arg(builder)), "type") => builder.ty = Some(value.as_str().to_owned()),
                (Some(State::Arg(builder)), "direction") => {
                    builder.direction = Some(match value.as_str() {
                        "in" => Direction::In,
                        _ => Direction::Out,
                    });
                }
                _ => {}
            },
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::new(ErrorKind::InvalidIntrospectionXml("unclosed element".to_string())));
    }

    Ok(root.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <node name="/org/example/Demo">
          <interface name="org.example.Demo">
            <method name="Add">
              <arg name="a" type="i" direction="in"/>
              <arg name="b" type="i" direction="in"/>
              <arg name="sum" type="i" direction="out"/>
            </method>
            <signal name="Pinged">
              <arg name="count" type="u"/>
            </signal>
          </interface>
          <node name="child"/>
        </node>
    "#;

    #[test]
    fn parses_interface_and_method_signatures() {
        let node = parse(SAMPLE).unwrap();
        let iface = node.interface("org.example.Demo").unwrap();
        let method = iface.method("Add").unwrap();
        assert_eq!(method.in_signature().unwrap().as_str(), "ii");
        assert_eq!(method.out_signature().unwrap().as_str(), "i");
    }

    #[test]
    fn signal_args_default_to_out_direction() {
        let node = parse(SAMPLE).unwrap();
        let iface = node.interface("org.example.Demo").unwrap();
        let signal = iface.signal("Pinged").unwrap();
        assert_eq!(signal.args[0].direction, Direction::Out);
        assert_eq!(signal.signature().unwrap().as_str(), "u");
    }

    #[test]
    fn nested_node_is_recorded() {
        let node = parse(SAMPLE).unwrap();
        assert_eq!(node.nodes.len(), 1);
        assert_eq!(node.nodes[0].name.as_deref(), Some("child"));
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(parse("<node><interface name=\"x\">").is_err());
    }
}
